use std::io::Write;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use tracing_subscriber::EnvFilter;

mod cli;
mod config;
mod csv_io;
mod eid;
mod grouping;
mod keywords;
mod lock;
mod normalizer;
mod prompts;
mod providers;
mod storage;
mod taxonomy;
#[cfg(test)]
mod tests;
mod web;

use cli::{Command, PromptAction};
use grouping::{BatchResult, BatchStatus, CancelToken, Engine, EngineFactory, Progress, SubmitRequest};
use keywords::KeywordQuery;

fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = cli::Args::parse();
    let paths = EngineFactory::get_paths()?;

    let writable = match &args.command {
        Command::Submit { .. } | Command::Import { .. } | Command::Restore { .. } | Command::Daemon { .. } => true,
        Command::Prompt { action } => matches!(action, PromptAction::Add { .. } | PromptAction::Activate { .. }),
        _ => false,
    };
    let engine = EngineFactory::create_engine(&paths, writable)?;

    match args.command {
        Command::Daemon { addr } => {
            web::start_daemon(Arc::new(engine), &addr)?;
        }

        Command::Submit {
            keywords,
            file,
            language,
            provider,
            prompt_version,
            force,
        } => {
            let keywords = if !keywords.is_empty() {
                keywords
            } else if let Some(file) = file {
                let data = std::fs::read(&file).with_context(|| format!("failed to read {file}"))?;
                csv_io::parse_lines(&csv_io::decode(&data))
            } else {
                let text = std::io::read_to_string(std::io::stdin()).context("failed to read stdin")?;
                csv_io::parse_lines(&text)
            };

            let cancel = cancel_on_ctrlc()?;
            let request = SubmitRequest {
                keywords,
                language,
                provider,
                prompt_version,
                force,
            };
            let result = run_batch(&engine, request, &cancel)?;
            println!("{}", serde_json::to_string_pretty(&result)?);

            if result.status == BatchStatus::Failed {
                bail!(
                    "batch {} failed: {}",
                    result.batch_id,
                    result.error_summary.unwrap_or_default()
                );
            }
        }

        Command::Import {
            path,
            provider,
            language,
            prompt_version,
            force,
        } => {
            let data = std::fs::read(&path).with_context(|| format!("failed to read {path}"))?;
            let items = csv_io::read_keywords(&data)?;
            let groups = csv_io::group_by_language(items, language.as_deref())?;
            log::info!("importing path={path} batches={}", groups.len());

            let cancel = cancel_on_ctrlc()?;
            let mut results = vec![];
            for (lang, keywords) in groups {
                if cancel.is_cancelled() {
                    log::warn!("import cancelled, {} batches done", results.len());
                    break;
                }
                let request = SubmitRequest {
                    keywords,
                    language: Some(lang),
                    provider,
                    prompt_version: prompt_version.clone(),
                    force,
                };
                results.push(run_batch(&engine, request, &cancel)?);
            }
            println!("{}", serde_json::to_string_pretty(&results)?);

            if results.iter().any(|r| r.status == BatchStatus::Failed) {
                bail!("one or more batches failed");
            }
        }

        Command::Export { output } => {
            let rows = engine.snapshot()?;
            match output {
                Some(output) => {
                    let file = std::fs::File::create(&output).with_context(|| format!("failed to create {output}"))?;
                    csv_io::write_export(&rows, file)?;
                    log::info!("exported rows={} path={output}", rows.len());
                }
                None => {
                    let stdout = std::io::stdout();
                    csv_io::write_export(&rows, stdout.lock())?;
                }
            }
        }

        Command::Restore { path } => {
            let data = std::fs::read(&path).with_context(|| format!("failed to read {path}"))?;
            let rows = csv_io::read_export(&data)?;
            let stats = engine.restore(rows)?;
            println!("inserted {} rows, updated {} rows", stats.inserted, stats.updated);
        }

        Command::Query {
            main_cat,
            sub_cat_1,
            sub_cat_2,
            language,
            page,
            per_page,
            count,
        } => {
            let page = engine.query(&KeywordQuery {
                main_cat,
                sub_cat_1,
                sub_cat_2,
                language,
                page,
                per_page,
            })?;

            if count {
                println!("{} keywords found", page.total);
                return Ok(());
            }
            println!("{}", serde_json::to_string_pretty(&page)?);
        }

        Command::Taxonomy { digest, json } => {
            if digest {
                println!("{}", engine.digest());
            } else if json {
                println!("{}", serde_json::to_string_pretty(engine.taxonomy().nodes())?);
            } else {
                print!("{}", engine.taxonomy().outline());
                std::io::stdout().flush()?;
            }
        }

        Command::Prompt { action } => match action {
            PromptAction::List => {
                for template in engine.prompts().list()? {
                    println!(
                        "{}{} {} {}",
                        if template.active { "* " } else { "  " },
                        template.version,
                        template.created_at,
                        &template.hash[..12.min(template.hash.len())]
                    );
                }
            }
            PromptAction::Show { version } => {
                let template = engine.prompts().resolve(version.as_deref())?;
                println!("{}", template.text);
            }
            PromptAction::Add { file, activate } => {
                let text = std::fs::read_to_string(&file).with_context(|| format!("failed to read {file}"))?;
                let (template, created) = engine.prompts().add(&text)?;
                if !created {
                    println!("template already stored as {}", template.version);
                } else {
                    println!("added {}", template.version);
                }
                if activate {
                    engine.prompts().activate(&template.version)?;
                    println!("{} is now active", template.version);
                }
            }
            PromptAction::Activate { version } => {
                let template = engine.prompts().activate(&version)?;
                println!("{} is now active", template.version);
            }
        },
    }

    Ok(())
}

fn run_batch(engine: &Engine, request: SubmitRequest, cancel: &CancelToken) -> anyhow::Result<BatchResult> {
    let bar = ProgressBar::new(0);
    if let Ok(style) = ProgressStyle::with_template("{spinner} [{bar:40}] {pos}/{len} chunks {elapsed}") {
        bar.set_style(style);
    }
    let progress = |p: Progress| {
        bar.set_length(p.total as u64);
        bar.set_position(p.done as u64);
    };

    let result = engine.submit(request, cancel, &progress);
    bar.finish_and_clear();
    Ok(result?)
}

/// First ctrl-c stops new chunks from starting; in-flight calls finish.
fn cancel_on_ctrlc() -> anyhow::Result<CancelToken> {
    let cancel = CancelToken::new();
    let handle = cancel.clone();
    ctrlc::set_handler(move || {
        log::warn!("received ctrl-c, finishing in-flight chunks");
        handle.cancel();
    })
    .context("failed to install ctrl-c handler")?;
    Ok(cancel)
}
