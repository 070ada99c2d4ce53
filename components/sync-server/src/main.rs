/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;

use sync_server::{api, AppState, EventStreamConfig, SyncStorage};

#[derive(Debug, Parser)]
#[command(name = "syncserverd", about = "Conversation sync server")]
struct Args {
    /// Path of the sqlite database holding the revision log.
    #[arg(long, env = "SYNC_DB_PATH", default_value = "sync-conversations.db")]
    db_path: PathBuf,

    /// Address to listen on.
    #[arg(long, env = "SYNC_ADDR", default_value = "127.0.0.1:8384")]
    addr: SocketAddr,

    /// Maximum accepted request body, in bytes.
    #[arg(long, env = "SYNC_MAX_BODY_BYTES", default_value_t = api::DEFAULT_MAX_BODY_BYTES)]
    max_body_bytes: usize,

    /// Seconds between keep-alive pings on the event stream.
    #[arg(long, default_value_t = 25)]
    events_keep_alive_secs: u64,

    /// Seconds an event stream lives before the server closes it, forcing
    /// clients back through the authorization gates.
    #[arg(long, default_value_t = 60)]
    events_ttl_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let storage = SyncStorage::new(&args.db_path)
        .with_context(|| format!("opening database at {}", args.db_path.display()))?;
    let state = AppState {
        storage: Arc::new(storage),
        notifier: sync_server::ChangeNotifier::new(),
        events: EventStreamConfig {
            keep_alive: Duration::from_secs(args.events_keep_alive_secs),
            ttl: Duration::from_secs(args.events_ttl_secs),
            retry_hint: Duration::from_secs(3),
        },
        max_body_bytes: args.max_body_bytes,
    };

    let listener = tokio::net::TcpListener::bind(args.addr)
        .await
        .with_context(|| format!("binding {}", args.addr))?;
    log::info!("listening on {}", args.addr);

    axum::serve(listener, sync_server::router(state))
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            log::info!("shutting down");
        })
        .await?;
    Ok(())
}
