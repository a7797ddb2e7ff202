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

mod args;
mod fetch;
mod partition;
mod probe;
mod session;
mod sink;

use indicatif::ProgressStyle;
use std::{process::ExitCode, sync::Arc};
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::Level;
use tracing_indicatif::{IndicatifLayer, span_ext::IndicatifSpanExt as _};
use tracing_subscriber::{
    fmt::writer::MakeWriterExt as _, layer::SubscriberExt as _, util::SubscriberInitExt as _,
};

use args::{Args, parse_args};
use session::{Session, SessionError};
use sink::{Destination, OrderedSink, PositionedFile, SequentialWriter};

async fn transfer<D: Destination + 'static>(
    args: &Args,
    client: reqwest::Client,
    destination: D,
    token: CancellationToken,
    progress: Option<tracing::Span>,
) -> Result<u64, SessionError> {
    let sink = Arc::new(match progress {
        Some(span) => OrderedSink::with_progress(destination, span),
        None => OrderedSink::new(destination),
    });
    let mut session =
        Session::new(client, args.url.clone(), args.transfer_config()).with_cancellation(token);
    let result = session.run(sink).await;
    tracing::debug!(state = ?session.state(), probe = ?session.probe(), "Session finished");
    result
}

#[tokio::main]
async fn main() -> ExitCode {
    let indicatif_layer = IndicatifLayer::new().with_progress_style(
        ProgressStyle::with_template(
            "[{elapsed_precise}] [{wide_bar}] {bytes:>10}/{total_bytes:10} ({binary_bytes_per_sec}) ETA: {eta}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-"),
    );
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(
                    indicatif_layer
                        .get_stderr_writer()
                        .with_max_level(Level::INFO),
                )
                .with_target(false),
        )
        .with(indicatif_layer)
        .init();

    let (args, client) = match parse_args() {
        Ok(parsed) => parsed,
        Err(err) => {
            tracing::error!("aborting: {err}");
            return ExitCode::FAILURE;
        }
    };

    let progress = (!args.quiet).then(|| {
        let span = tracing::info_span!("transfer");
        span.pb_start();
        span
    });

    // Handle ctrl-c
    let token = CancellationToken::new();
    tokio::task::spawn({
        let token = token.clone();
        async move {
            _ = tokio::signal::ctrl_c().await;
            token.cancel();
        }
    });

    let result = match &args.output {
        Some(path) => match fs::File::create(path).await {
            Ok(file) => transfer(&args, client, PositionedFile::new(file), token, progress).await,
            Err(err) => {
                tracing::error!(
                    "aborting: could not create output file {}: {err}",
                    path.display()
                );
                return ExitCode::FAILURE;
            }
        },
        None => {
            let stdout = SequentialWriter::new(tokio::io::stdout());
            transfer(&args, client, stdout, token, progress).await
        }
    };

    match result {
        Ok(_) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("aborting: {err}");
            ExitCode::FAILURE
        }
    }
}
