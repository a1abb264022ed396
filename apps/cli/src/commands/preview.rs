//! Preview command implementation.

use crate::commands::types::PreviewArgs;
use anyhow::{Context, Result};
use colored::Colorize;
use serde::Serialize;
use std::sync::Arc;
use tracetune_training::{load_records, load_tokenizer, BuilderOptions, ExampleBuilder, RawRecord, ThinkingMode};

#[derive(Debug, Serialize)]
struct PreviewRow {
    index: usize,
    question: String,
    completion: Option<String>,
    prompt_tokens: Option<usize>,
    total_tokens: Option<usize>,
    example_tokens: Option<usize>,
    trainable_tokens: Option<usize>,
    error: Option<String>,
}

pub async fn execute(args: PreviewArgs) -> Result<()> {
    let records = load_records(&args.data_path)
        .with_context(|| format!("Failed to load dataset {}", args.data_path.display()))?;
    let tokenizer = load_tokenizer(&args.model_path).context("Failed to load tokenizer")?;
    let strategy = args.base_model.strategy(tokenizer.as_ref())?;
    let builder = ExampleBuilder::new(
        Arc::clone(&tokenizer),
        BuilderOptions {
            strategy,
            thinking: ThinkingMode::from_flags(args.think_flag == 1, args.base_flag == 1),
            max_seq_len: args.max_seq_len,
        },
    );

    let rows: Vec<PreviewRow> =
        records.iter().take(args.count).enumerate().map(|(index, record)| preview_record(&builder, index, record)).collect();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    println!();
    println!("{}", format!("Preview ({} of {} records)", rows.len(), records.len()).bold().cyan());
    for row in &rows {
        println!();
        println!("{} {}", format!("#{}", row.index).bold(), row.question.dimmed());
        if let Some(error) = &row.error {
            println!("  {} {}", "invalid:".red(), error);
            continue;
        }
        println!(
            "  prompt tokens: {}  total: {}  kept: {}  trainable: {}",
            row.prompt_tokens.unwrap_or_default(),
            row.total_tokens.unwrap_or_default(),
            row.example_tokens.unwrap_or_default(),
            row.trainable_tokens.unwrap_or_default().to_string().green()
        );
        if let Some(completion) = &row.completion {
            println!("{}", "  trained text:".dimmed());
            for line in completion.lines() {
                println!("    {line}");
            }
        }
    }
    if builder.parse_failures() > 0 {
        println!();
        println!(
            "  {}",
            format!("{} response(s) had no <think> block", builder.parse_failures()).yellow()
        );
    }
    println!();
    Ok(())
}

fn preview_record(builder: &ExampleBuilder, index: usize, record: &RawRecord) -> PreviewRow {
    let mut row = PreviewRow {
        index,
        question: record.question.clone(),
        completion: None,
        prompt_tokens: None,
        total_tokens: None,
        example_tokens: None,
        trainable_tokens: None,
        error: None,
    };

    match builder.build_detailed(record) {
        Ok(built) => {
            row.completion = Some(built.exchange.completion().to_string());
            row.prompt_tokens = Some(built.prompt_tokens);
            row.total_tokens = Some(built.full_tokens);
            row.example_tokens = Some(built.example.len());
            row.trainable_tokens = Some(built.example.trainable_tokens());
        }
        Err(e) => row.error = Some(e.to_string()),
    }
    row
}
