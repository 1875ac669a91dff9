mod cli;

use anyhow::Context;
use clap::Parser;
use cli::{ChaptersArgs, Cli, Commands, CoverArgs, ListArgs};
use ebook_structurer::{
    BookExtractor, Chapter, ChapterReport, CoverOutcome, EbookError, ExtractConfig,
    SourceResolver,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn, Level};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(log_level.as_str())),
        )
        .with_target(false)
        .init();

    let result = match &cli.command {
        Commands::Chapters(args) => handle_chapters_command(args, &cli.output).await,
        Commands::Toc(args) => handle_toc_command(args, &cli.output).await,
        Commands::Metadata(args) => handle_metadata_command(args, &cli.output).await,
        Commands::Cover(args) => handle_cover_command(args, &cli.output).await,
    };

    if let Err(e) = result {
        error!("Operation failed: {:#}", e);
        std::process::exit(1);
    }

    Ok(())
}

fn build_extractor(output_dir: &Path, jpeg_quality: u8) -> anyhow::Result<Arc<BookExtractor>> {
    let config = ExtractConfig {
        output_dir: output_dir.to_path_buf(),
        jpeg_quality,
    };
    let extractor = BookExtractor::new(config).context("Failed to initialize extractor")?;
    Ok(Arc::new(extractor))
}

fn resolve_books(sources: &[String], extractor: &Arc<BookExtractor>) -> anyhow::Result<Vec<PathBuf>> {
    let books = SourceResolver::resolve_sources(sources, |path| extractor.supports(path))
        .context("Failed to resolve input sources")?;
    if books.is_empty() {
        anyhow::bail!("No supported books found in the given sources");
    }
    info!("Resolved {} books", books.len());
    Ok(books)
}

/// Runs `job` for every book on the blocking pool and gathers the results
/// in input order. A failing book does not stop the others.
async fn run_per_book<T, F>(
    books: Vec<PathBuf>,
    extractor: &Arc<BookExtractor>,
    job: F,
) -> Vec<(PathBuf, Result<T, EbookError>)>
where
    T: Send + 'static,
    F: Fn(&BookExtractor, &Path) -> Result<T, EbookError> + Send + Sync + Copy + 'static,
{
    let handles: Vec<_> = books
        .into_iter()
        .map(|book| {
            let extractor = Arc::clone(extractor);
            tokio::task::spawn_blocking(move || {
                let result = job(&extractor, &book);
                (book, result)
            })
        })
        .collect();

    let mut results = Vec::with_capacity(handles.len());
    for handle in handles {
        match handle.await {
            Ok(outcome) => results.push(outcome),
            Err(e) => error!("Extraction task panicked: {}", e),
        }
    }
    results
}

fn report_failures(failures: usize, total: usize) -> anyhow::Result<()> {
    if failures > 0 {
        anyhow::bail!("{} of {} books failed", failures, total);
    }
    Ok(())
}

fn file_stem(book: &Path) -> String {
    book.file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("book")
        .to_string()
}

async fn handle_chapters_command(args: &ChaptersArgs, output_dir: &Path) -> anyhow::Result<()> {
    let extractor = build_extractor(output_dir, ExtractConfig::default().jpeg_quality)?;
    let books = resolve_books(&args.sources, &extractor)?;
    let total = books.len();

    tokio::fs::create_dir_all(output_dir)
        .await
        .with_context(|| format!("Failed to create output directory {}", output_dir.display()))?;

    let results = run_per_book(books, &extractor, |extractor, book| {
        extractor.extract_chapters(book)
    })
    .await;

    let failures = total - results.len() + write_chapter_results(results, args, output_dir).await;
    report_failures(failures, total)
}

/// Writes the outputs of every extracted book and returns how many books
/// failed, during extraction or while writing. A failed write does not stop
/// the remaining books.
async fn write_chapter_results(
    results: Vec<(PathBuf, Result<Vec<Chapter>, EbookError>)>,
    args: &ChaptersArgs,
    output_dir: &Path,
) -> usize {
    let mut failures = 0;

    for (book, result) in results {
        let chapters = match result {
            Ok(chapters) => chapters,
            Err(e) => {
                error!("✗ {}: {}", book.display(), e);
                failures += 1;
                continue;
            }
        };

        if chapters.is_empty() {
            warn!("{} has no table of contents; no chapters extracted", book.display());
        }

        if args.detailed {
            println!("\n=== Chapters of '{}' ===", SourceResolver::display_name(&book));
            for chapter in &chapters {
                println!(
                    "{}{} ({} lines, {} blocks)",
                    "  ".repeat(chapter.level.saturating_sub(1)),
                    chapter.title,
                    chapter.raw_content.len(),
                    chapter.structured_content.len()
                );
            }
        }

        match write_chapter_outputs(&book, chapters, args.text, output_dir).await {
            Ok((json_path, total_chapters)) => info!(
                "✓ {}: {} chapters -> {}",
                book.display(),
                total_chapters,
                json_path.display()
            ),
            Err(e) => {
                error!("✗ {}: {:#}", book.display(), e);
                failures += 1;
            }
        }
    }

    failures
}

async fn write_chapter_outputs(
    book: &Path,
    chapters: Vec<Chapter>,
    text: bool,
    output_dir: &Path,
) -> anyhow::Result<(PathBuf, usize)> {
    let stem = file_stem(book);
    if text {
        let rendered: String = chapters.iter().map(|c| c.to_string()).collect();
        let text_path = output_dir.join(format!("{}_chapters.md", stem));
        tokio::fs::write(&text_path, rendered)
            .await
            .with_context(|| format!("Failed to write {}", text_path.display()))?;
    }

    let report = ChapterReport {
        source: SourceResolver::display_name(book),
        extracted_at: chrono::Utc::now().to_rfc3339(),
        total_chapters: chapters.len(),
        chapters,
    };
    let json_path = output_dir.join(format!("{}_chapters.json", stem));
    write_json(&json_path, &report).await?;

    Ok((json_path, report.total_chapters))
}

async fn handle_toc_command(args: &ListArgs, output_dir: &Path) -> anyhow::Result<()> {
    let extractor = build_extractor(output_dir, ExtractConfig::default().jpeg_quality)?;
    let books = resolve_books(&args.sources, &extractor)?;
    let total = books.len();

    let results = run_per_book(books, &extractor, |extractor, book| {
        extractor.extract_chapter_list(book)
    })
    .await;

    let mut failures = total - results.len();
    let mut all_lists = BTreeMap::new();

    for (book, result) in results {
        match result {
            Ok(list) => {
                println!("\n=== Table of contents for '{}' ===", SourceResolver::display_name(&book));
                for entry in &list {
                    println!("{}{}  [{}]", "  ".repeat(entry.level), entry.title, entry.location);
                }
                all_lists.insert(book.display().to_string(), list);
            }
            Err(e) => {
                error!("✗ {}: {}", book.display(), e);
                failures += 1;
            }
        }
    }

    if let Some(json_path) = &args.json_output {
        write_json(json_path, &all_lists).await?;
        info!("Chapter lists written to: {}", json_path.display());
    }

    report_failures(failures, total)
}

async fn handle_metadata_command(args: &ListArgs, output_dir: &Path) -> anyhow::Result<()> {
    let extractor = build_extractor(output_dir, ExtractConfig::default().jpeg_quality)?;
    let books = resolve_books(&args.sources, &extractor)?;
    let total = books.len();

    let results = run_per_book(books, &extractor, |extractor, book| {
        extractor.extract_metadata(book)
    })
    .await;

    let mut failures = total - results.len();
    let mut all_metadata = BTreeMap::new();

    for (book, result) in results {
        match result {
            Ok(metadata) => {
                println!("\n=== Metadata for '{}' ===", SourceResolver::display_name(&book));
                for (key, value) in &metadata {
                    println!("{}: {}", key, value);
                }
                all_metadata.insert(book.display().to_string(), metadata);
            }
            Err(e) => {
                error!("✗ {}: {}", book.display(), e);
                failures += 1;
            }
        }
    }

    if let Some(json_path) = &args.json_output {
        write_json(json_path, &all_metadata).await?;
        info!("Metadata written to: {}", json_path.display());
    }

    report_failures(failures, total)
}

async fn handle_cover_command(args: &CoverArgs, output_dir: &Path) -> anyhow::Result<()> {
    let extractor = build_extractor(output_dir, args.quality)?;
    let books = resolve_books(&args.sources, &extractor)?;
    let total = books.len();

    let results = run_per_book(books, &extractor, |extractor, book| {
        extractor.extract_cover(book, &extractor.config().output_dir)
    })
    .await;

    let mut failures = total - results.len();
    for (book, result) in results {
        match result {
            Ok(CoverOutcome::Extracted(path)) => {
                info!("✓ {}: cover saved to {}", book.display(), path.display())
            }
            Ok(CoverOutcome::NoCover) => info!("- {}: book has no cover", book.display()),
            Err(e) => {
                error!("✗ {}: {}", book.display(), e);
                failures += 1;
            }
        }
    }

    report_failures(failures, total)
}

async fn write_json<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let json_content =
        serde_json::to_string_pretty(value).context("Failed to serialize results")?;

    tokio::fs::write(path, json_content)
        .await
        .with_context(|| format!("Failed to write JSON file {}", path.display()))?;
    Ok(())
}
