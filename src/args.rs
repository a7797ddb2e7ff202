// Copyright (c) 2024-2025 Federico G. Schwindt <fgsch@lodoss.net>
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.

use clap::{
    Parser,
    error::{Error, ErrorKind},
};
use reqwest::{Client, Url};
use std::{num::NonZeroUsize, path::PathBuf, time::Duration};
use thiserror::Error;

use crate::fetch::{DEFAULT_MAX_RETRIES, RetryPolicy};
use crate::session::{DEFAULT_CONCURRENCY, TransferConfig};

#[derive(Error, Debug)]
pub enum ArgsError {
    #[error("Failed to build HTTP client: {0}")]
    ClientBuild(#[from] reqwest::Error),
}

#[derive(Parser, Debug, Clone)]
#[command(
    version,
    about,
    long_about = "Fetch an HTTP resource over several concurrent ranged connections and write it in order"
)]
pub struct Args {
    /// URL to fetch (http or https)
    #[arg(value_parser = parse_url)]
    pub url: Url,

    /// Write output to this file instead of stdout
    #[arg(long, short)]
    pub output: Option<PathBuf>,

    /// Number of concurrent ranged connections
    #[arg(long, short, default_value_t = DEFAULT_CONCURRENCY, value_parser = parse_greater_than_zero)]
    pub concurrency: usize,

    /// Number of retries for each range after a transient failure
    #[arg(long, default_value_t = DEFAULT_MAX_RETRIES)]
    pub max_retries: usize,

    /// Connect timeout in seconds
    #[arg(long, default_value = "30", value_parser = parse_duration_seconds)]
    pub connect_timeout: Duration,

    /// Timeout in seconds for each read from a connection
    #[arg(long, default_value = "60", value_parser = parse_duration_seconds)]
    pub read_timeout: Duration,

    /// Disable progress bar output
    #[arg(long, short, default_value_t = false)]
    pub quiet: bool,

    /// User-Agent string for HTTP requests
    #[arg(long, short, default_value_t = concat!("rangecat/",
        env!("CARGO_PKG_VERSION_MAJOR"),
        ".",
        env!("CARGO_PKG_VERSION_MINOR")).to_string())]
    pub user_agent: String,
}

impl Args {
    pub fn transfer_config(&self) -> TransferConfig {
        TransferConfig {
            concurrency: NonZeroUsize::new(self.concurrency).unwrap_or(NonZeroUsize::MIN),
            retry: RetryPolicy {
                max_retries: self.max_retries,
                ..RetryPolicy::default()
            },
        }
    }
}

fn parse_url(s: &str) -> Result<Url, Error> {
    let url = Url::parse(s).map_err(|err| {
        Error::raw(
            ErrorKind::InvalidValue,
            format!("could not parse `{s}` as a URL: {err}"),
        )
    })?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        scheme => Err(Error::raw(
            ErrorKind::InvalidValue,
            format!("unsupported URL scheme `{scheme}`, expected http or https"),
        )),
    }
}

fn parse_greater_than_zero(s: &str) -> Result<usize, Error> {
    let v = s.parse().map_err(|_| {
        Error::raw(
            ErrorKind::InvalidValue,
            format!("`{s}` isn't a valid integer"),
        )
    })?;
    if v == 0 {
        Err(Error::raw(
            ErrorKind::InvalidValue,
            "Value must be greater than 0",
        ))
    } else {
        Ok(v)
    }
}

fn parse_duration_seconds(s: &str) -> Result<Duration, Error> {
    let seconds = parse_greater_than_zero(s)?;
    Ok(Duration::from_secs(seconds as u64))
}

pub fn build_client(args: &Args) -> Result<Client, ArgsError> {
    // Byte offsets must refer to the stored representation, so never ask
    // for or undo a content encoding.
    let client = reqwest::Client::builder()
        .connect_timeout(args.connect_timeout)
        .read_timeout(args.read_timeout)
        .user_agent(&args.user_agent)
        .no_gzip()
        .no_brotli()
        .no_deflate()
        .build()?;
    Ok(client)
}

pub fn parse_args() -> Result<(Args, Client), ArgsError> {
    let args = Args::parse();
    let client = build_client(&args)?;
    Ok((args, client))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::error::ErrorKind;
    use std::time::Duration;

    #[test]
    fn parse_greater_than_zero_valid() {
        assert_eq!(parse_greater_than_zero("1").unwrap(), 1);
        assert_eq!(parse_greater_than_zero("5").unwrap(), 5);
        assert_eq!(parse_greater_than_zero("999999").unwrap(), 999_999);
    }

    #[test]
    fn parse_greater_than_zero_invalid_zero() {
        let error = parse_greater_than_zero("0").unwrap_err();
        assert_eq!(error.kind(), ErrorKind::InvalidValue);
        assert!(error.to_string().contains("Value must be greater than 0"));
    }

    #[test]
    fn parse_greater_than_zero_invalid_non_numeric() {
        let error = parse_greater_than_zero("abc").unwrap_err();
        assert_eq!(error.kind(), ErrorKind::InvalidValue);
        assert!(error.to_string().contains("`abc` isn't a valid integer"));
    }

    #[test]
    fn parse_greater_than_zero_invalid_negative() {
        let error = parse_greater_than_zero("-1").unwrap_err();
        assert!(error.to_string().contains("`-1` isn't a valid integer"));
    }

    #[test]
    fn parse_duration_seconds_valid() {
        assert_eq!(parse_duration_seconds("1").unwrap(), Duration::from_secs(1));
        assert_eq!(
            parse_duration_seconds("30").unwrap(),
            Duration::from_secs(30)
        );
    }

    #[test]
    fn parse_url_accepts_http_and_https() {
        assert_eq!(
            parse_url("http://example.com/a.iso").unwrap().as_str(),
            "http://example.com/a.iso"
        );
        assert_eq!(parse_url("https://example.com/").unwrap().scheme(), "https");
    }

    #[test]
    fn parse_url_rejects_other_schemes() {
        let error = parse_url("ftp://example.com/file").unwrap_err();
        assert_eq!(error.kind(), ErrorKind::InvalidValue);
        assert!(error.to_string().contains("unsupported URL scheme `ftp`"));

        // Bare words such as `help` parse as relative URLs and fail here.
        let error = parse_url("help").unwrap_err();
        assert!(error.to_string().contains("could not parse `help`"));
    }

    #[test]
    fn defaults() {
        let args = Args::try_parse_from(["rangecat", "https://example.com/big.bin"]).unwrap();
        assert_eq!(args.concurrency, 5);
        assert_eq!(args.max_retries, 3);
        assert_eq!(args.output, None);
        assert!(!args.quiet);
        assert_eq!(args.connect_timeout, Duration::from_secs(30));

        let config = args.transfer_config();
        assert_eq!(config.concurrency.get(), 5);
        assert_eq!(config.retry.max_retries, 3);
    }

    #[test]
    fn output_and_concurrency_flags() {
        let args = Args::try_parse_from([
            "rangecat",
            "-o",
            "out.bin",
            "-c",
            "8",
            "--max-retries",
            "0",
            "http://example.com/f",
        ])
        .unwrap();
        assert_eq!(args.output, Some(PathBuf::from("out.bin")));
        assert_eq!(args.transfer_config().concurrency.get(), 8);
        assert_eq!(args.transfer_config().retry.max_retries, 0);
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let error = Args::try_parse_from(["rangecat", "-c", "0", "http://example.com/f"]).unwrap_err();
        assert_eq!(error.kind(), ErrorKind::ValueValidation);
    }

    #[test]
    fn client_builds() {
        let args = Args::try_parse_from(["rangecat", "http://example.com/f"]).unwrap();
        assert!(build_client(&args).is_ok());
    }
}
