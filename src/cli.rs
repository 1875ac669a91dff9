use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "ebook-struct")]
#[command(about = "A CLI tool for turning ebooks into chapter-segmented structured content")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output directory for extracted files
    #[arg(short, long, global = true, default_value = "./output")]
    pub output: PathBuf,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Extract structured chapters
    Chapters(ChaptersArgs),

    /// List chapter titles without content
    Toc(ListArgs),

    /// Show normalized document metadata
    Metadata(ListArgs),

    /// Extract cover images
    Cover(CoverArgs),
}

#[derive(Args)]
pub struct ChaptersArgs {
    /// Input sources (book files or directories)
    #[arg(required = true, value_name = "SOURCE")]
    pub sources: Vec<String>,

    /// Also write a markdown rendering of every chapter
    #[arg(long)]
    pub text: bool,

    /// Show per-chapter block counts
    #[arg(long)]
    pub detailed: bool,
}

#[derive(Args)]
pub struct ListArgs {
    /// Input sources (book files or directories)
    #[arg(required = true, value_name = "SOURCE")]
    pub sources: Vec<String>,

    /// Write results to a JSON file
    #[arg(long, value_name = "FILE")]
    pub json_output: Option<PathBuf>,
}

#[derive(Args)]
pub struct CoverArgs {
    /// Input sources (book files or directories)
    #[arg(required = true, value_name = "SOURCE")]
    pub sources: Vec<String>,

    /// JPEG quality for rendered covers
    #[arg(long, default_value = "95", value_parser = clap::value_parser!(u8).range(1..=100))]
    pub quality: u8,
}
