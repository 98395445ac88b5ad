use std::convert::Infallible;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use log::{error, info};
use tokio::net::TcpListener;

use webgames::auth::hash_password;
use webgames::config::{Args, Command, Config};
use webgames::rdb::{RelationalDatabase, SqliteRdb};
use webgames::server::{handle_request, AppState};

/// Create a verified admin account against the durable identity store.
async fn create_admin(args: &Args, username: &str, email: &str, password: &str) -> ExitCode {
    let rdb = match SqliteRdb::connect(&args.rdb_url).await {
        Ok(rdb) => rdb,
        Err(e) => {
            eprintln!("Cannot open identity store {}: {e}", args.rdb_url);
            return ExitCode::from(1);
        }
    };

    let userid = uuid::Uuid::new_v4();
    let hashed = match hash_password(password) {
        Ok(hashed) => hashed,
        Err(e) => {
            eprintln!("Cannot hash password: {e}");
            return ExitCode::from(1);
        }
    };
    let created = async {
        rdb.create_user(userid, username, email, &hashed).await?;
        rdb.set_user_admin(userid, true).await?;
        rdb.set_user_verified(userid, true).await
    };
    match created.await {
        Ok(()) => {
            println!("Admin account created: {userid}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Cannot create admin account: {e}");
            ExitCode::from(1)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    pretty_env_logger::init();

    let args = Args::parse();

    if let Some(Command::CreateAdmin {
        username,
        email,
        password,
    }) = &args.command
    {
        return create_admin(&args, username, email, password).await;
    }

    let config = match Config::from_args(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            return ExitCode::from(1);
        }
    };

    let state = match AppState::new(config).await {
        Ok(state) => Arc::new(state),
        Err(e) => {
            eprintln!("Cannot initialize the service: {e}");
            return ExitCode::from(1);
        }
    };

    let listener = match TcpListener::bind(state.config.bind).await {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("Cannot bind {}: {e}", state.config.bind);
            return ExitCode::from(1);
        }
    };

    println!("Starting webgames server listening on address: {}", state.config.bind);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received.");
                state.shutdown();
                break;
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("Accept failed: {e}");
                        continue;
                    }
                };
                let io = TokioIo::new(stream);

                // Serve each connection on its own task so long-lived streams never
                // block the accept loop.
                let state = state.clone();
                tokio::task::spawn(async move {
                    let peer_ip = peer.ip();
                    let service = service_fn(move |req| {
                        let state = state.clone();
                        async move { Ok::<_, Infallible>(handle_request(req, state, peer_ip).await) }
                    });

                    if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                        error!("Error serving connection: {err:?}");
                    }
                });
            }
        }
    }

    ExitCode::SUCCESS
}
