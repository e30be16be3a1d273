//! Operator tool: build one digest end to end and print it, without sending anything.
//!
//! Uses the same config files and environment variables as the main binary.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use common::Config;
use futures::{stream, StreamExt};
use std::path::PathBuf;

use newsbrief::assembler::assemble;
use newsbrief::model::{Citation, Digest, Topic};
use newsbrief::scraping::ContentExtractor;
use newsbrief::search::SearchProvider;
use newsbrief::setup::{build_extractor, build_search, build_summarizer, pipeline_options};

#[derive(Parser, Debug)]
#[command(name = "preview_digest", about = "Render a digest for one query without emailing it")]
struct Args {
    /// Search query to build the digest from
    query: String,

    /// Display name used in the subject and prompt (defaults to the query)
    #[arg(long)]
    name: Option<String>,

    #[arg(long, value_name = "FILE", default_value = "config.toml")]
    config: PathBuf,

    /// Print the plain-text body instead of the HTML
    #[arg(long)]
    text: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_writer(std::io::stderr)
        .init();

    let default_path = PathBuf::from("config.default.toml");
    let config = Config::load_with_defaults(
        if default_path.exists() { Some(&default_path) } else { None },
        Some(&args.config),
    )
    .await
    .context("failed to load configuration")?;
    let options = pipeline_options(&config);

    let topic = Topic {
        id: "preview".to_string(),
        display_name: args.name.clone().unwrap_or_else(|| args.query.clone()),
        search_query: args.query.clone(),
        active: true,
    };

    let search = build_search(&config)?;
    let extractor = build_extractor(&config)?;
    let summarizer = build_summarizer(&config)?;

    let results = search.search(&topic.search_query, options.max_results).await?;
    eprintln!("{} search results", results.len());

    let articles: Vec<_> = stream::iter(results.iter())
        .map(|r| extractor.extract(&r.url))
        .buffered(options.extraction_concurrency.max(1))
        .collect()
        .await;
    for a in &articles {
        eprintln!("  {:?} {}", a.status, a.url);
    }

    let summary = summarizer.summarize(&topic, &articles).await?;
    let citations = results
        .iter()
        .zip(articles.iter())
        .filter(|(_, a)| a.is_ok())
        .map(|(r, _)| Citation {
            url: r.url.clone(),
            title: r.title.clone(),
            source: r.source.clone(),
            date: r.date.clone(),
        })
        .collect();
    let digest = Digest {
        topic_id: topic.id.clone(),
        summary,
        citations,
        generated_at: Utc::now(),
    };

    let message = assemble(&topic, &digest, &options.assembler);
    eprintln!("Subject: {}", message.subject);
    if args.text {
        println!("{}", message.text_body);
    } else {
        println!("{}", message.html_body);
    }
    Ok(())
}
