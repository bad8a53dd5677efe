//! Process entry point: wires the K/V store, the router's collaborators,
//! and a length-delimited framed TCP transport together, then runs the
//! accept loop until a shutdown signal drains it within the configured
//! grace window.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use backplane::Backplane;
use clap::Parser;
use config::PuzzleConfig;
use connection_registry::ConnectionRegistry;
use futures::{SinkExt, StreamExt};
use kv_store::{InMemoryKvStore, KvStore, RedisKvStore};
use lock_coordinator::LockCoordinator;
use parking_lot::Mutex;
use piece_store::{InMemoryPieceStore, Position};
use serde_json::{json, Value};
use session_router::{RouterConfig, SessionRouter};
use task_executor::{Executor, TailTasks};
use testutil::{InMemoryChatRepository, InMemorySessionDirectory};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, Notify};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use wire::{ClientFrame, Op, RouterError, ServerFrame, WireError};

type Router = SessionRouter<InMemoryPieceStore, InMemoryChatRepository, InMemorySessionDirectory>;

/// Maps the hub's workspace-wide dependency shards to worker thread count,
/// the same convention `connection_registry` documents for its own
/// sharding (`worker_threads * 4`).
fn shard_count() -> usize {
    std::thread::available_parallelism().map(|n| n.get() * 4).unwrap_or(16)
}

#[derive(Parser, Debug)]
#[command(name = "hub_server", about = "Real-time jigsaw puzzle collaboration backplane")]
struct Cli {
    /// Path to an optional TOML config file, layered under environment overrides.
    #[arg(long, env = "PUZZLE_HUB_CONFIG_FILE")]
    config_file: Option<PathBuf>,

    /// Seeds one hardcoded active session (`demo`, puzzle `demo-puzzle`, 4
    /// pieces) at startup, for manual smoke-testing without a real session
    /// metadata service.
    #[arg(long)]
    demo_session: bool,
}

#[tokio::main]
async fn main() {
    logging::init();
    let cli = Cli::parse();

    let puzzle_config = match PuzzleConfig::load(cli.config_file.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            log::error!("failed to load configuration: {err}");
            std::process::exit(1);
        }
    };

    let kv: Arc<dyn KvStore> = if puzzle_config.kv_endpoint.is_empty() {
        log::info!("no kv-endpoint configured; using the in-memory store (single replica only)");
        Arc::new(InMemoryKvStore::new())
    } else {
        match RedisKvStore::connect(&puzzle_config.kv_endpoint, puzzle_config.kv_password.as_deref()).await {
            Ok(store) => Arc::new(store),
            Err(err) => {
                log::error!("failed to connect to kv-endpoint {}: {err}", puzzle_config.kv_endpoint);
                std::process::exit(1);
            }
        }
    };

    let replica_id = uuid::Uuid::new_v4().to_string();
    log::info!("starting hub_server replica {replica_id}");

    let registry = Arc::new(ConnectionRegistry::new(shard_count(), kv.clone()));
    let pieces = Arc::new(InMemoryPieceStore::new(
        puzzle_config.position_tolerance,
        puzzle_config.rotation_tolerance_degrees,
    ));
    let locks = Arc::new(LockCoordinator::new(
        kv.clone(),
        pieces.clone(),
        Duration::from_secs(puzzle_config.lock_ttl_seconds),
    ));
    let chat = Arc::new(InMemoryChatRepository::new());
    let directory = Arc::new(InMemorySessionDirectory::new());

    if cli.demo_session {
        seed_demo_session(&directory, &pieces);
    }

    let backplane = Backplane::new(kv.clone(), puzzle_config.backplane_channel_prefix.clone(), replica_id.clone());
    let executor = Executor::borrowed();
    let router = Arc::new(SessionRouter::new(
        registry,
        locks,
        pieces,
        chat,
        directory,
        backplane,
        executor.clone(),
        RouterConfig {
            lock_ttl: Duration::from_secs(puzzle_config.lock_ttl_seconds),
            cursor_window: Duration::from_millis(puzzle_config.cursor_window_ms),
        },
    ));

    let listener = match TcpListener::bind(&puzzle_config.listen_address).await {
        Ok(listener) => listener,
        Err(err) => {
            log::error!("failed to bind {}: {err}", puzzle_config.listen_address);
            std::process::exit(1);
        }
    };
    log::info!("listening on {}", puzzle_config.listen_address);

    let shutting_down = Arc::new(AtomicBool::new(false));
    let shutdown_signal = Arc::new(Notify::new());
    spawn_signal_watcher(shutting_down.clone(), shutdown_signal.clone());

    let closers: Arc<Mutex<HashMap<String, oneshot::Sender<()>>>> = Arc::new(Mutex::new(HashMap::new()));
    let idle_timeout = Duration::from_secs(puzzle_config.idle_timeout_seconds);
    spawn_sweeper(router.clone(), closers.clone(), idle_timeout);

    let mut tail = TailTasks::new(executor.clone());
    loop {
        tokio::select! {
            biased;
            () = shutdown_signal.notified() => {
                log::info!("shutdown signal received; no longer accepting new connections");
                break;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let router = router.clone();
                        let shutting_down = shutting_down.clone();
                        let closers = closers.clone();
                        let op_deadline = Duration::from_secs(puzzle_config.op_deadline_seconds);
                        let keepalive_interval = Duration::from_secs(puzzle_config.keepalive_interval_seconds);
                        let connection_id = uuid::Uuid::new_v4().to_string();
                        let name = format!("conn-{connection_id}");
                        tail.spawn(name, async move {
                            handle_connection(
                                stream,
                                connection_id,
                                router,
                                shutting_down,
                                closers,
                                op_deadline,
                                keepalive_interval,
                            )
                            .await;
                        });
                        log::debug!("accepted connection from {peer}");
                    }
                    Err(err) => log::warn!("accept failed: {err}"),
                }
            }
        }
    }

    tail.join_all(Duration::from_secs(puzzle_config.shutdown_grace_seconds)).await;
    log::info!("shutdown complete");
}

fn seed_demo_session(directory: &InMemorySessionDirectory, pieces: &InMemoryPieceStore) {
    directory.seed("demo", "demo-puzzle", session_router::SessionStatus::Active);
    let seeded: Vec<(String, Position, Position)> = (0..4)
        .map(|i| {
            let target = Position {
                x: f64::from(i) * 50.0,
                y: 0.0,
                rotation: 0.0,
            };
            let initial = Position {
                x: target.x + 200.0,
                y: target.y + 200.0,
                rotation: 90.0,
            };
            (format!("piece-{i}"), target, initial)
        })
        .collect();
    pieces.seed_puzzle("demo", seeded);
    log::info!("seeded demo session \"demo\" with 4 pieces");
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut terminate = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

fn spawn_signal_watcher(shutting_down: Arc<AtomicBool>, shutdown_signal: Arc<Notify>) {
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        shutting_down.store(true, Ordering::SeqCst);
        shutdown_signal.notify_waiters();
    });
}

/// Periodically evicts connections whose inbound liveness has lapsed,
/// through the same `disconnect` cleanup path an explicit close uses.
fn spawn_sweeper(router: Arc<Router>, closers: Arc<Mutex<HashMap<String, oneshot::Sender<()>>>>, idle_timeout: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(idle_timeout.max(Duration::from_secs(1)) / 2);
        loop {
            ticker.tick().await;
            for connection_id in router.find_stale_connections(idle_timeout) {
                log::info!("evicting idle connection {connection_id}");
                if let Err(err) = router.disconnect(&connection_id).await {
                    log::warn!("error disconnecting idle connection {connection_id}: {err}");
                }
                if let Some(closer) = closers.lock().remove(&connection_id) {
                    let _ = closer.send(());
                }
            }
        }
    });
}

/// Drives one client connection end to end: the handshake, the inbound
/// frame loop, outbound delivery, and keepalive, until the socket closes,
/// the connection is swept for inactivity, or it is force-closed on
/// shutdown.
async fn handle_connection(
    stream: TcpStream,
    connection_id: String,
    router: Arc<Router>,
    shutting_down: Arc<AtomicBool>,
    closers: Arc<Mutex<HashMap<String, oneshot::Sender<()>>>>,
    op_deadline: Duration,
    keepalive_interval: Duration,
) {
    let _ = stream.set_nodelay(true);
    let mut framed = Framed::new(stream, LengthDelimitedCodec::new());

    let handshake = match framed.next().await {
        Some(Ok(bytes)) => bytes,
        Some(Err(err)) => {
            log::warn!("connection {connection_id} failed before handshake: {err}");
            return;
        }
        None => return,
    };

    let (seq, user_id, session_id) = match parse_handshake(&handshake) {
        Ok(parsed) => parsed,
        Err((seq, wire_error)) => {
            let frame = ServerFrame::Response {
                seq,
                name: Op::JoinSession.name().to_string(),
                ok: false,
                result: None,
                error: Some(wire_error),
            };
            let _ = send_frame(&mut framed, &frame).await;
            return;
        }
    };

    let mut outbound = match router.register_connection(&connection_id, &user_id).await {
        Ok(outbound) => outbound,
        Err(err) => {
            log::error!("failed to register connection {connection_id}: {err}");
            return;
        }
    };

    let join_result = router.join_session(&connection_id, &session_id).await;
    let response = match &join_result {
        Ok(snapshot) => ServerFrame::ok(seq, Op::JoinSession, serde_json::to_value(snapshot).unwrap_or(Value::Null)),
        Err(err) => ServerFrame::err(seq, Op::JoinSession, err),
    };
    if send_frame(&mut framed, &response).await.is_err() {
        let _ = router.disconnect(&connection_id).await;
        return;
    }
    if join_result.is_err() {
        let _ = router.disconnect(&connection_id).await;
        return;
    }

    let (close_tx, mut close_rx) = oneshot::channel();
    closers.lock().insert(connection_id.clone(), close_tx);

    let mut keepalive = tokio::time::interval(keepalive_interval);
    keepalive.tick().await; // first tick fires immediately; skip it.

    loop {
        tokio::select! {
            biased;
            _ = &mut close_rx => {
                log::debug!("connection {connection_id} force-closed by the sweeper or shutdown");
                break;
            }
            frame = outbound.recv() => {
                match frame {
                    Some(frame) => {
                        if send_frame(&mut framed, &frame).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            _ = keepalive.tick() => {
                let frame = ServerFrame::event_named("keepalive", Value::Null);
                if send_frame(&mut framed, &frame).await.is_err() {
                    break;
                }
            }
            inbound = framed.next() => {
                match inbound {
                    Some(Ok(bytes)) => {
                        let _ = router.touch(&connection_id).await;
                        if let Some(response) = handle_inbound(&router, &connection_id, &bytes, &shutting_down, op_deadline).await {
                            if send_frame(&mut framed, &response).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Err(err)) => {
                        log::warn!("connection {connection_id} read error: {err}");
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    closers.lock().remove(&connection_id);
    let _ = router.disconnect(&connection_id).await;
}

fn parse_handshake(bytes: &[u8]) -> Result<(u64, String, String), (u64, WireError)> {
    let frame: ClientFrame = serde_json::from_slice(bytes).map_err(|_| {
        (
            0,
            WireError {
                code: "BinaryNotSupported".to_string(),
                message: "the first frame must be a UTF-8 JSON join-session request".to_string(),
                current_owner: None,
            },
        )
    })?;
    if Op::parse(&frame.op) != Some(Op::JoinSession) {
        return Err((
            frame.seq,
            WireError {
                code: "InvalidHandshake".to_string(),
                message: "the first frame on a connection must be join-session".to_string(),
                current_owner: None,
            },
        ));
    }
    let user_id = frame
        .args
        .get("user-id")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| {
            (
                frame.seq,
                WireError {
                    code: "InvalidHandshake".to_string(),
                    message: "join-session args must include a non-empty user-id".to_string(),
                    current_owner: None,
                },
            )
        })?
        .to_string();
    let session_id = frame
        .args
        .get("session-id")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    Ok((frame.seq, user_id, session_id))
}

/// Dispatches one already-handshaken inbound frame, returning the response
/// frame to send back (or `None` for malformed/binary frames the caller
/// already answered).
async fn handle_inbound(
    router: &Arc<Router>,
    connection_id: &str,
    bytes: &[u8],
    shutting_down: &AtomicBool,
    op_deadline: Duration,
) -> Option<ServerFrame> {
    let frame: ClientFrame = match serde_json::from_slice(bytes) {
        Ok(frame) => frame,
        Err(_) => {
            return Some(ServerFrame::Response {
                seq: 0,
                name: "unknown".to_string(),
                ok: false,
                result: None,
                error: Some(WireError {
                    code: "BinaryNotSupported".to_string(),
                    message: "binary frames are not supported; send UTF-8 JSON text frames".to_string(),
                    current_owner: None,
                }),
            });
        }
    };

    let Some(op) = Op::parse(&frame.op) else {
        return Some(ServerFrame::Response {
            seq: frame.seq,
            name: frame.op.clone(),
            ok: false,
            result: None,
            error: Some(WireError {
                code: "Internal".to_string(),
                message: format!("unknown operation \"{}\"", frame.op),
                current_owner: None,
            }),
        });
    };

    if shutting_down.load(Ordering::SeqCst) {
        return Some(ServerFrame::err(frame.seq, op, &RouterError::ShuttingDown));
    }

    // `cursor` never produces a response frame: spec.md says it "never
    // fails visibly to the caller".
    if op == Op::Cursor {
        if let (Some(x), Some(y)) = (frame.args.get("x").and_then(Value::as_f64), frame.args.get("y").and_then(Value::as_f64)) {
            router.cursor(connection_id, x, y);
        }
        return None;
    }

    let outcome = tokio::time::timeout(op_deadline, dispatch(router, connection_id, op, &frame.args))
        .await
        .unwrap_or(Err(RouterError::Timeout));

    Some(match outcome {
        Ok(result) => ServerFrame::ok(frame.seq, op, result),
        Err(err) => ServerFrame::err(frame.seq, op, &err),
    })
}

async fn dispatch(router: &Arc<Router>, connection_id: &str, op: Op, args: &Value) -> Result<Value, RouterError> {
    match op {
        Op::JoinSession => {
            let session_id = args.get("session-id").and_then(Value::as_str).unwrap_or_default();
            let result = router.join_session(connection_id, session_id).await?;
            Ok(serde_json::to_value(result).expect("join-session result is always representable as JSON"))
        }
        Op::LeaveSession => {
            router.leave_session(connection_id).await?;
            Ok(json!({}))
        }
        Op::MovePiece => {
            let piece_id = args.get("piece-id").and_then(Value::as_str).unwrap_or_default();
            let x = args.get("x").and_then(Value::as_f64).unwrap_or(0.0);
            let y = args.get("y").and_then(Value::as_f64).unwrap_or(0.0);
            let rotation = args.get("rotation").and_then(Value::as_f64).unwrap_or(0.0);
            let result = router.move_piece(connection_id, piece_id, x, y, rotation).await?;
            Ok(serde_json::to_value(result).expect("move-piece result is always representable as JSON"))
        }
        Op::LockPiece => {
            let piece_id = args.get("piece-id").and_then(Value::as_str).unwrap_or_default();
            let result = router.lock_piece(connection_id, piece_id).await?;
            Ok(serde_json::to_value(result).expect("lock-piece result is always representable as JSON"))
        }
        Op::UnlockPiece => {
            let piece_id = args.get("piece-id").and_then(Value::as_str).unwrap_or_default();
            router.unlock_piece(connection_id, piece_id).await?;
            Ok(json!({}))
        }
        Op::SendChat => {
            let text = args.get("text").and_then(Value::as_str).unwrap_or_default();
            let result = router.send_chat(connection_id, text).await?;
            Ok(serde_json::to_value(result).expect("send-chat result is always representable as JSON"))
        }
        Op::Cursor => unreachable!("cursor is handled before dispatch"),
    }
}

async fn send_frame(framed: &mut Framed<TcpStream, LengthDelimitedCodec>, frame: &ServerFrame) -> std::io::Result<()> {
    let bytes = serde_json::to_vec(frame).expect("server frames are always representable as JSON");
    framed.send(bytes.into()).await
}
