//! TCP 服务端
//!
//! 报文为 UTF-8 单行文本（JSON 或 `ping`/`disconnect`），以换行分隔。
//! 每个连接一个线程：首行必须是注册报文，之后逐行交给 [`ConnectionManager`]。
//! 非 UTF-8 或超过 `max_line_bytes` 的行只拒绝该行，连接保持。

use crate::broadcast::{Observer, TcpObserver};
use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::manager::{ConnectionManager, Flow, Session};
use crate::store::StoreWriter;
use gaitwatch_protocol::{InboundMessage, Register, ServerMessage};
use std::io::{self, BufRead, BufReader, ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// 监听器空闲轮询间隔
const ACCEPT_POLL: Duration = Duration::from_millis(50);

/// 监控服务端
pub struct MonitorServer {
    listener: TcpListener,
    manager: Arc<ConnectionManager>,
    is_running: Arc<AtomicBool>,
}

impl MonitorServer {
    /// 绑定监听地址
    pub fn bind(config: ServerConfig, store: StoreWriter) -> Result<Self, ServerError> {
        config.validate()?;
        let listener =
            TcpListener::bind(&config.bind_addr).map_err(|source| ServerError::Bind {
                addr: config.bind_addr.clone(),
                source,
            })?;
        // 非阻塞 accept，便于轮询停止标志
        listener.set_nonblocking(true)?;
        info!("Monitor server listening on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            manager: ConnectionManager::new(config, store),
            is_running: Arc::new(AtomicBool::new(true)),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    /// 停止标志（置 false 后 `serve` 返回）
    pub fn running_flag(&self) -> Arc<AtomicBool> {
        self.is_running.clone()
    }

    /// 运行 accept 循环，直到停止标志被清除
    pub fn serve(&self) -> Result<(), ServerError> {
        while self.is_running.load(Ordering::Acquire) {
            match self.listener.accept() {
                Ok((stream, peer)) => self.spawn_connection(stream, peer),
                Err(e) if e.kind() == ErrorKind::WouldBlock => std::thread::sleep(ACCEPT_POLL),
                Err(e) if e.kind() == ErrorKind::Interrupted => {},
                Err(e) => {
                    error!("Accept failed: {}", e);
                    return Err(e.into());
                },
            }
        }

        info!("Monitor server stopping, closing {} session(s)", self.manager.connection_count());
        self.manager.close_all();
        Ok(())
    }

    /// 在后台线程运行
    pub fn spawn(self) -> Result<ServerHandle, ServerError> {
        let addr = self.local_addr()?;
        let manager = self.manager.clone();
        let is_running = self.is_running.clone();
        let thread = std::thread::Builder::new()
            .name("gw-accept".into())
            .spawn(move || self.serve())
            .map_err(|source| ServerError::ThreadSpawn {
                name: "gw-accept".into(),
                source,
            })?;

        Ok(ServerHandle {
            addr,
            manager,
            is_running,
            thread: Some(thread),
        })
    }

    fn spawn_connection(&self, stream: TcpStream, peer: SocketAddr) {
        debug!("Accepted connection from {}", peer);
        let manager = self.manager.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("gw-conn-{}", peer.port()))
            .spawn(move || {
                if let Err(e) = handle_connection(&manager, stream) {
                    warn!("Connection from {} ended: {}", peer, e);
                }
            });
        if let Err(e) = spawned {
            error!("Failed to spawn connection thread for {}: {}", peer, e);
        }
    }
}

/// 后台运行的服务端句柄
pub struct ServerHandle {
    addr: SocketAddr,
    manager: Arc<ConnectionManager>,
    is_running: Arc<AtomicBool>,
    thread: Option<JoinHandle<Result<(), ServerError>>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    /// 停止并等待 accept 线程退出
    pub fn shutdown(mut self) -> Result<(), ServerError> {
        self.stop()
    }

    fn stop(&mut self) -> Result<(), ServerError> {
        self.is_running.store(false, Ordering::Release);
        match self.thread.take().map(JoinHandle::join) {
            Some(Ok(result)) => result,
            Some(Err(_)) => {
                error!("Accept thread panicked");
                Ok(())
            },
            None => Ok(()),
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!("Server stopped with error: {}", e);
        }
    }
}

/// 处理单个连接，直到对端断开或请求关闭
fn handle_connection(manager: &ConnectionManager, stream: TcpStream) -> Result<(), ServerError> {
    let config = manager.config();
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(config.register_timeout()))?;
    stream.set_write_timeout(Some(config.write_timeout()))?;

    let max_line = config.max_line_bytes;
    let mut reader = BufReader::new(stream.try_clone()?);
    let register = match read_register(&mut reader, max_line) {
        Ok(register) => register,
        Err(e) => {
            let reply = ServerMessage::Error {
                message: e.to_string(),
            };
            if let Ok(text) = reply.encode() {
                let mut writer = &stream;
                let _ = writer.write_all(text.as_bytes());
                let _ = writer.write_all(b"\n");
            }
            return Err(e);
        },
    };
    stream.set_read_timeout(None)?;

    let observer: Arc<dyn Observer> = Arc::new(TcpObserver::new(register.user_id.clone(), stream));
    let session = manager.connect(register, observer);

    let mut buf = Vec::new();
    loop {
        let line = match read_frame(&mut reader, &mut buf, max_line) {
            Ok(Frame::Line(line)) => line,
            Ok(Frame::Eof) => {
                debug!("'{}' closed the connection", session.user_id);
                break;
            },
            Ok(Frame::Invalid) => {
                warn!("Rejected non UTF-8 line from '{}'", session.user_id);
                reject(manager, &session, "message is not valid UTF-8".to_string());
                continue;
            },
            Ok(Frame::Oversized) => {
                warn!(
                    "Rejected line over {} bytes from '{}'",
                    max_line, session.user_id
                );
                reject(manager, &session, format!("message exceeds {} bytes", max_line));
                continue;
            },
            Err(e) => {
                debug!("Read from '{}' failed: {}", session.user_id, e);
                break;
            },
        };
        if line.trim().is_empty() {
            continue;
        }
        if manager.handle_line(&session, &line) == Flow::Close {
            break;
        }
    }

    manager.disconnect(&session.user_id, session.observer.id());
    Ok(())
}

fn reject(manager: &ConnectionManager, session: &Session, message: String) {
    manager.reply(session, &ServerMessage::Error { message });
}

/// 一行入站数据
#[derive(Debug, PartialEq)]
enum Frame {
    Line(String),
    /// 不是合法 UTF-8
    Invalid,
    /// 超过长度上限，已丢弃到行尾
    Oversized,
    Eof,
}

/// 读取一行（至多 `max` 字节，不含换行）
///
/// 按字节累积，整行读完后再做 UTF-8 校验。
fn read_frame(reader: &mut impl BufRead, buf: &mut Vec<u8>, max: usize) -> io::Result<Frame> {
    buf.clear();
    let limit = max as u64 + 1;
    if reader.by_ref().take(limit).read_until(b'\n', buf)? == 0 {
        return Ok(Frame::Eof);
    }
    if !buf.ends_with(b"\n") && buf.len() > max {
        reader.skip_until(b'\n')?;
        return Ok(Frame::Oversized);
    }
    match std::str::from_utf8(buf) {
        Ok(line) => Ok(Frame::Line(line.to_string())),
        Err(_) => Ok(Frame::Invalid),
    }
}

fn read_register(reader: &mut impl BufRead, max_line: usize) -> Result<Register, ServerError> {
    let mut buf = Vec::new();
    let line = match read_frame(reader, &mut buf, max_line)? {
        Frame::Line(line) => line,
        Frame::Eof => return Err(ServerError::RegistrationRequired("<eof>".to_string())),
        Frame::Invalid => {
            return Err(ServerError::RegistrationRequired("<invalid utf-8>".to_string()));
        },
        Frame::Oversized => {
            return Err(ServerError::RegistrationRequired(format!(
                "<line over {} bytes>",
                max_line
            )));
        },
    };
    match InboundMessage::decode(&line)? {
        InboundMessage::Register(register) if !register.user_id.is_empty() => Ok(register),
        _ => Err(ServerError::RegistrationRequired(line.trim().to_string())),
    }
}
