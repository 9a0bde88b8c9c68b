//! 传输会话
//!
//! - [`Connector`] / [`Link`]: 连接抽象（测试中可替换为内存实现）
//! - [`TcpConnector`] / [`TcpLink`]: 按行分隔的 JSON over TCP
//! - [`Backoff`]: 指数退避（首次 1s，翻倍，上限 30s，连接成功后复位）

use crate::error::TransportError;
use gaitwatch_protocol::{Register, Role};
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;
use tracing::{debug, info, warn};

/// 一条已建立的逻辑连接
pub trait Link: Send {
    /// 发送一行文本（自动追加换行）
    fn send_line(&mut self, line: &str) -> Result<(), TransportError>;

    /// 非阻塞地取出已到达的入站行
    ///
    /// 对端关闭时返回 [`TransportError::Closed`]。
    fn poll_incoming(&mut self) -> Result<Vec<String>, TransportError> {
        Ok(Vec::new())
    }
}

/// 连接工厂
pub trait Connector: Send {
    fn connect(&mut self) -> Result<Box<dyn Link>, TransportError>;

    /// 目标描述（用于日志）
    fn target(&self) -> String;
}

/// TCP 连接工厂
///
/// 连接建立后立即发送注册行 `{"type":"register","data":{"user_id",..,"role":"device"}}`。
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: String,
    user_id: String,
    connect_timeout: Duration,
    write_timeout: Duration,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            user_id: user_id.into(),
            connect_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_timeouts(mut self, connect: Duration, write: Duration) -> Self {
        self.connect_timeout = connect;
        self.write_timeout = write;
        self
    }

    fn register_line(&self) -> Result<String, TransportError> {
        let register = Register {
            user_id: self.user_id.clone(),
            role: Role::Device,
        };
        let line = serde_json::to_string(&serde_json::json!({
            "type": "register",
            "data": register,
        }))
        .map_err(gaitwatch_protocol::ProtocolError::from)?;
        Ok(line)
    }
}

impl Connector for TcpConnector {
    fn connect(&mut self) -> Result<Box<dyn Link>, TransportError> {
        let connect_err = |source: std::io::Error| TransportError::Connect {
            addr: self.addr.clone(),
            source,
        };

        let addrs: Vec<_> = self
            .addr
            .to_socket_addrs()
            .map_err(connect_err)?
            .collect();

        let mut last_err = std::io::Error::new(ErrorKind::AddrNotAvailable, "no address resolved");
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.connect_timeout) {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    stream.set_write_timeout(Some(self.write_timeout))?;
                    let mut link = TcpLink::new(stream)?;
                    link.send_line(&self.register_line()?)?;
                    info!("Connected to {} as '{}'", addr, self.user_id);
                    return Ok(Box::new(link));
                },
                Err(e) => last_err = e,
            }
        }
        Err(connect_err(last_err))
    }

    fn target(&self) -> String {
        self.addr.clone()
    }
}

/// TCP 连接
pub struct TcpLink {
    writer: TcpStream,
    reader: BufReader<TcpStream>,
    /// 未读完的行（原始字节，整行到齐后再解码）
    partial: Vec<u8>,
}

impl TcpLink {
    pub fn new(stream: TcpStream) -> Result<Self, TransportError> {
        let read_half = stream.try_clone()?;
        // SO_RCVTIMEO 只影响读，写仍然阻塞（受 write_timeout 约束）
        read_half.set_read_timeout(Some(Duration::from_millis(1)))?;
        Ok(Self {
            writer: stream,
            reader: BufReader::new(read_half),
            partial: Vec::new(),
        })
    }
}

impl Link for TcpLink {
    fn send_line(&mut self, line: &str) -> Result<(), TransportError> {
        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }

    fn poll_incoming(&mut self) -> Result<Vec<String>, TransportError> {
        let mut lines = Vec::new();
        loop {
            match self.reader.read_until(b'\n', &mut self.partial) {
                Ok(0) if lines.is_empty() => return Err(TransportError::Closed),
                // 先交付已读到的行，下次调用再报告关闭
                Ok(0) => break,
                Ok(_) => {
                    if self.partial.ends_with(b"\n") {
                        let bytes = std::mem::take(&mut self.partial);
                        match String::from_utf8(bytes) {
                            Ok(line) => {
                                let line = line.trim_end();
                                if !line.is_empty() {
                                    lines.push(line.to_string());
                                }
                            },
                            Err(e) => warn!("Dropping non UTF-8 line from server: {}", e),
                        }
                    }
                },
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    break;
                },
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        if !lines.is_empty() {
            debug!("Received {} line(s) from server", lines.len());
        }
        Ok(lines)
    }
}

/// 指数退避
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            current: initial,
        }
    }

    /// 返回本次等待时长，并把下次等待翻倍（不超过上限）
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    /// 连接成功后复位
    pub fn reset(&mut self) {
        self.current = self.initial;
    }

    pub fn current(&self) -> Duration {
        self.current
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut backoff = Backoff::default();
        let delays: Vec<u64> = (0..7).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_tcp_link_registers_and_frames_lines() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let server = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut register = String::new();
            reader.read_line(&mut register).unwrap();
            let mut payload = String::new();
            reader.read_line(&mut payload).unwrap();
            let mut writer = stream;
            writer.write_all(b"pong\n").unwrap();
            (register, payload)
        });

        let mut connector = TcpConnector::new(addr, "pi_07");
        let mut link = connector.connect().unwrap();
        link.send_line(r#"{"type":"imu_data"}"#).unwrap();

        let (register, payload) = server.join().unwrap();
        let value: serde_json::Value = serde_json::from_str(&register).unwrap();
        assert_eq!(value["type"], "register");
        assert_eq!(value["data"]["user_id"], "pi_07");
        assert_eq!(value["data"]["role"], "device");
        assert_eq!(payload.trim_end(), r#"{"type":"imu_data"}"#);

        // 服务端写完后关闭，先读到 pong，再读到关闭
        let mut received = Vec::new();
        let closed = loop {
            match link.poll_incoming() {
                Ok(lines) => received.extend(lines),
                Err(TransportError::Closed) => break true,
                Err(e) => panic!("unexpected error: {}", e),
            }
            std::thread::sleep(Duration::from_millis(5));
        };
        assert!(closed);
        assert_eq!(received, vec!["pong".to_string()]);
    }

    #[test]
    fn test_multibyte_line_split_across_reads() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let bytes = "{\"message\":\"걷기\"}\n".as_bytes();
            // 在多字节字符中间切开，两段之间超过读超时
            let cut = bytes.iter().position(|&b| b >= 0x80).unwrap() + 1;
            stream.write_all(&bytes[..cut]).unwrap();
            stream.flush().unwrap();
            std::thread::sleep(Duration::from_millis(50));
            stream.write_all(&bytes[cut..]).unwrap();
            stream
        });

        let mut link = TcpLink::new(TcpStream::connect(addr).unwrap()).unwrap();
        let mut received = Vec::new();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while received.is_empty() && std::time::Instant::now() < deadline {
            received.extend(link.poll_incoming().unwrap());
            std::thread::sleep(Duration::from_millis(5));
        }
        let _stream = server.join().unwrap();
        assert_eq!(received, vec!["{\"message\":\"걷기\"}".to_string()]);
    }

    #[test]
    fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let mut connector = TcpConnector::new(addr, "pi");
        assert!(matches!(
            connector.connect(),
            Err(TransportError::Connect { .. })
        ));
    }
}
