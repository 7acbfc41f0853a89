//! Command-line interface definitions for DergiPark Gate.
//!
//! This module defines the CLI arguments and subcommands using the `clap`
//! crate. API keys can be provided via flags or environment variables.

use crate::config::Secrets;
use crate::models::{IndexFilter, SortOrder};
use crate::scrapers::dergipark::SearchQuery;
use crate::service::SearchRequest;
use clap::{ArgAction, Args, Parser, Subcommand};
use std::path::PathBuf;

/// Command-line arguments for the DergiPark Gate application.
///
/// Every subcommand prints its outcome as pretty JSON on stdout; logs go to
/// stderr.
///
/// # Examples
///
/// ```sh
/// # Search, newest first, second page of 24
/// dergipark_gate search "yapay zeka" --sort newest --api-page 2
///
/// # Only journals indexed by TR Dizin
/// dergipark_gate search hukuk --index-filter tr-index
///
/// # Extract the text of an article PDF
/// dergipark_gate convert 4152368
///
/// # Solve the challenge ahead of time
/// dergipark_gate --capsolver-api-key KEY session
/// ```
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    /// Optional path to config.yaml file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// CapSolver API key for token challenges
    #[arg(long, env = "CAPSOLVER_API_KEY", hide_env_values = true, global = true)]
    pub capsolver_api_key: Option<String>,

    /// Mistral API key for OCR of scanned PDFs
    #[arg(long, env = "MISTRAL_API_KEY", hide_env_values = true, global = true)]
    pub mistral_api_key: Option<String>,

    /// Run the automation browser without a window
    #[arg(long, env = "HEADLESS", default_value_t = true, action = ArgAction::Set, global = true)]
    pub headless: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Search articles and fetch their metadata and journal indexes
    Search(SearchArgs),
    /// Download an article PDF and extract its text
    Convert {
        /// Article file id or its download URL
        input: String,
    },
    /// List the references of an article
    References {
        /// Article page URL
        url: String,
    },
    /// Acquire (or reuse) a session and report its lifetime
    Session,
}

#[derive(Args, Debug)]
pub struct SearchArgs {
    /// Search terms; empty matches everything
    #[arg(default_value = "")]
    pub query: String,

    /// Upstream result page
    #[arg(long, default_value_t = 1)]
    pub page: usize,

    /// Result ordering (relevance when omitted)
    #[arg(long, value_enum)]
    pub sort: Option<SortOrder>,

    /// Article type filter, as the site names it
    #[arg(long)]
    pub article_type: Option<String>,

    /// Publication year filter
    #[arg(long)]
    pub year: Option<String>,

    /// Page over the fetched result set, 24 articles each
    #[arg(long, default_value_t = 1)]
    pub api_page: usize,

    /// Keep only articles whose journal matches this index rule
    #[arg(long, value_enum, default_value_t = IndexFilter::All)]
    pub index_filter: IndexFilter,
}

impl Cli {
    pub fn secrets(&self) -> Secrets {
        Secrets {
            capsolver_api_key: self.capsolver_api_key.clone().filter(|k| !k.trim().is_empty()),
            mistral_api_key: self.mistral_api_key.clone().filter(|k| !k.trim().is_empty()),
        }
    }
}

impl From<SearchArgs> for SearchRequest {
    fn from(args: SearchArgs) -> Self {
        SearchRequest {
            query: SearchQuery {
                query: args.query,
                page: args.page.max(1),
                sort: args.sort,
                article_type: args.article_type,
                year: args.year,
            },
            api_page: args.api_page.max(1),
            index_filter: args.index_filter,
        }
    }
}
