//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Rate-limited HTTP requests and resumable downloads.
///
/// Requests to one host are spaced by the rate limit; downloads resume from
/// partial files and retry with backoff.
#[derive(Parser, Debug)]
#[command(name = "courier")]
#[command(author, version, about)]
pub struct Args {
    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Directory for persisted state such as cookies (default: ./.rnr)
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// JSON options file; flags override its values
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Maximum concurrent downloads (1-64)
    #[arg(long, global = true, value_parser = clap::value_parser!(u32).range(1..=64))]
    pub parallel: Option<u32>,

    /// Attempts per download (1-20)
    #[arg(long, global = true, value_parser = clap::value_parser!(u32).range(1..=20))]
    pub max_retries: Option<u32>,

    /// Minimum delay between requests to the same host in milliseconds (max 60000)
    #[arg(long, global = true, value_parser = clap::value_parser!(u64).range(0..=60000))]
    pub rate_limit: Option<u64>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Fetch a URL through the per-host queue and print or save the body
    Get {
        /// Absolute http(s) URL
        url: String,

        /// Query parameter overlaid onto the URL (key=value, repeatable)
        #[arg(long = "query", value_parser = parse_key_val)]
        query: Vec<(String, String)>,

        /// Extra request header (name=value, repeatable)
        #[arg(long = "header", value_parser = parse_key_val)]
        header: Vec<(String, String)>,

        /// Write the body to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Fail on 404 instead of printing nothing
        #[arg(long)]
        fail_on_404: bool,
    },

    /// Download a URL to a file, resuming and retrying as needed
    Download {
        /// Absolute http(s) URL
        url: String,

        /// Destination file
        destination: PathBuf,

        /// Extra request header (name=value, repeatable)
        #[arg(long = "header", value_parser = parse_key_val)]
        header: Vec<(String, String)>,

        /// Hide the progress bar
        #[arg(long)]
        no_progress: bool,
    },
}

fn parse_key_val(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got `{raw}`"))?;
    if key.is_empty() {
        return Err(format!("empty key in `{raw}`"));
    }
    Ok((key.to_string(), value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_get_parses() {
        let args = Args::try_parse_from(["courier", "get", "https://example.com/"]).unwrap();
        assert_eq!(args.verbose, 0);
        assert!(!args.quiet);
        match args.command {
            Command::Get {
                url,
                query,
                header,
                output,
                fail_on_404,
            } => {
                assert_eq!(url, "https://example.com/");
                assert!(query.is_empty());
                assert!(header.is_empty());
                assert!(output.is_none());
                assert!(!fail_on_404);
            }
            Command::Download { .. } => panic!("expected get"),
        }
    }

    #[test]
    fn test_cli_get_repeatable_pairs() {
        let args = Args::try_parse_from([
            "courier",
            "get",
            "https://example.com/",
            "--query",
            "page=2",
            "--query",
            "q=a=b",
            "--header",
            "Referer=https://example.com/",
        ])
        .unwrap();
        let Command::Get { query, header, .. } = args.command else {
            panic!("expected get");
        };
        assert_eq!(
            query,
            vec![
                ("page".to_string(), "2".to_string()),
                ("q".to_string(), "a=b".to_string())
            ]
        );
        assert_eq!(header[0].0, "Referer");
    }

    #[test]
    fn test_cli_rejects_pair_without_separator() {
        let result = Args::try_parse_from(["courier", "get", "https://example.com/", "--query", "page"]);
        assert_eq!(
            result.unwrap_err().kind(),
            clap::error::ErrorKind::ValueValidation
        );
    }

    #[test]
    fn test_cli_download_with_global_flags() {
        let args = Args::try_parse_from([
            "courier",
            "download",
            "https://example.com/a.bin",
            "out/a.bin",
            "--parallel",
            "4",
            "--rate-limit",
            "250",
            "-vv",
        ])
        .unwrap();
        assert_eq!(args.parallel, Some(4));
        assert_eq!(args.rate_limit, Some(250));
        assert_eq!(args.verbose, 2);
        let Command::Download { destination, .. } = args.command else {
            panic!("expected download");
        };
        assert_eq!(destination, PathBuf::from("out/a.bin"));
    }

    #[test]
    fn test_cli_parallel_zero_rejected() {
        let result = Args::try_parse_from([
            "courier",
            "--parallel",
            "0",
            "download",
            "https://example.com/a.bin",
            "a.bin",
        ]);
        assert_eq!(
            result.unwrap_err().kind(),
            clap::error::ErrorKind::ValueValidation
        );
    }

    #[test]
    fn test_cli_requires_subcommand() {
        let result = Args::try_parse_from(["courier"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_cli_help_flag_shows_usage() {
        let result = Args::try_parse_from(["courier", "--help"]);
        assert_eq!(
            result.unwrap_err().kind(),
            clap::error::ErrorKind::DisplayHelp
        );
    }

    #[test]
    fn test_cli_version_flag_shows_version() {
        let result = Args::try_parse_from(["courier", "--version"]);
        assert_eq!(
            result.unwrap_err().kind(),
            clap::error::ErrorKind::DisplayVersion
        );
    }
}
