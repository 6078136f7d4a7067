//! TCP 网关连接
//!
//! 同一个 socket 不能同时注册到两个 `mio::Registry`，因此连接建立后用
//! `try_clone` 复制出两个句柄：读半部归接收循环，写半部归发送循环。

use crate::GatewayError;
use bytes::{Buf, BytesMut};
use fpu_protocol::{FrameDecoder, GatewayFrame, MAX_ENCODED_FRAME_LEN, encode_frame_into};
use mio::event::Source;
use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// 接收缓冲区大小
const READ_CHUNK: usize = 4096;

/// 已建立但尚未拆分的网关连接
#[derive(Debug)]
pub struct GatewayLink {
    index: usize,
    peer: SocketAddr,
    stream: std::net::TcpStream,
}

impl GatewayLink {
    /// 连接网关
    ///
    /// 依次尝试地址解析出的每个候选地址，每个候选都受 `timeout` 约束。
    pub fn connect(index: usize, addr: &str, timeout: Duration) -> Result<Self, GatewayError> {
        let candidates: Vec<SocketAddr> = addr
            .to_socket_addrs()
            .map_err(|e| GatewayError::Resolve(format!("{addr}: {e}")))?
            .collect();
        if candidates.is_empty() {
            return Err(GatewayError::Resolve(addr.to_string()));
        }

        let mut last_err = None;
        for candidate in candidates {
            match std::net::TcpStream::connect_timeout(&candidate, timeout) {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    info!("Gateway {} connected: {}", index, candidate);
                    return Ok(Self {
                        index,
                        peer: candidate,
                        stream,
                    });
                },
                Err(e) => {
                    debug!("Gateway {}: connect to {} failed: {}", index, candidate, e);
                    last_err = Some(e);
                },
            }
        }

        match last_err {
            Some(e) if e.kind() == io::ErrorKind::TimedOut => Err(GatewayError::ConnectTimeout {
                addr: addr.to_string(),
                timeout,
            }),
            Some(e) => Err(GatewayError::Io(e)),
            None => Err(GatewayError::Resolve(addr.to_string())),
        }
    }

    /// 网关编号
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// 拆分为非阻塞的读、写半部
    pub fn split(self) -> Result<(GatewayRx, GatewayTx), GatewayError> {
        let read_half = self.stream.try_clone()?;
        read_half.set_nonblocking(true)?;
        self.stream.set_nonblocking(true)?;

        let rx = GatewayRx {
            index: self.index,
            stream: TcpStream::from_std(read_half),
            decoder: FrameDecoder::new(),
            buf: vec![0u8; READ_CHUNK].into_boxed_slice(),
            bytes_read: 0,
        };
        let tx = GatewayTx {
            index: self.index,
            stream: TcpStream::from_std(self.stream),
            pending: BytesMut::with_capacity(MAX_ENCODED_FRAME_LEN * 64),
            bytes_written: 0,
        };
        Ok((rx, tx))
    }
}

// ============================================================================
// 读半部
// ============================================================================

/// 一次读取的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// 内核缓冲区已读空（边沿触发下需要等待下一次可读事件）
    Drained { bytes: usize },
    /// 对端关闭连接
    Closed { bytes: usize },
}

/// 网关读半部
#[derive(Debug)]
pub struct GatewayRx {
    index: usize,
    stream: TcpStream,
    decoder: FrameDecoder,
    buf: Box<[u8]>,
    bytes_read: u64,
}

impl GatewayRx {
    pub fn index(&self) -> usize {
        self.index
    }

    /// 读取所有可用字节，对每个完整帧调用回调
    pub fn read_available(
        &mut self,
        mut on_frame: impl FnMut(GatewayFrame),
    ) -> Result<ReadStatus, GatewayError> {
        let mut total = 0usize;
        loop {
            match self.stream.read(&mut self.buf) {
                Ok(0) => {
                    info!("Gateway {}: peer closed connection", self.index);
                    return Ok(ReadStatus::Closed { bytes: total });
                },
                Ok(n) => {
                    total += n;
                    self.bytes_read += n as u64;
                    let index = self.index;
                    self.decoder.decode_slice(&self.buf[..n], |frame| {
                        trace!(
                            "Gateway {} RX bus={} id=0x{:03X} data={}",
                            index,
                            frame.bus,
                            frame.can_id,
                            hex::encode(frame.data_slice())
                        );
                        on_frame(frame);
                    });
                },
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(ReadStatus::Drained { bytes: total });
                },
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("Gateway {}: read error: {}", self.index, e);
                    return Err(GatewayError::Io(e));
                },
            }
        }
    }

    /// 解码器丢弃的畸形帧数量
    pub fn dropped_frames(&self) -> u64 {
        self.decoder.dropped_frames()
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }
}

impl Source for GatewayRx {
    fn register(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        self.stream.register(registry, token, interests)
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        self.stream.reregister(registry, token, interests)
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        self.stream.deregister(registry)
    }
}

// ============================================================================
// 写半部
// ============================================================================

/// 一次刷写的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushStatus {
    /// 待发送字节已全部写入内核
    Complete,
    /// 内核发送缓冲区已满，剩余字节等待下一次可写事件
    Blocked,
}

/// 网关写半部
///
/// 帧先被编码进内部缓冲区，再由 `flush` 尽可能多地写出；部分写入的
/// 字节保留到下一次可写事件。
#[derive(Debug)]
pub struct GatewayTx {
    index: usize,
    stream: TcpStream,
    pending: BytesMut,
    bytes_written: u64,
}

impl GatewayTx {
    pub fn index(&self) -> usize {
        self.index
    }

    /// 编码一帧并追加到待发送缓冲区
    pub fn queue_frame(&mut self, frame: &GatewayFrame) {
        trace!(
            "Gateway {} TX bus={} id=0x{:03X} data={}",
            self.index,
            frame.bus,
            frame.can_id,
            hex::encode(frame.data_slice())
        );
        encode_frame_into(frame, &mut self.pending);
    }

    /// 尽可能多地写出待发送字节
    pub fn flush(&mut self) -> Result<FlushStatus, GatewayError> {
        while !self.pending.is_empty() {
            match self.stream.write(&self.pending) {
                Ok(0) => return Err(GatewayError::Closed),
                Ok(n) => {
                    self.pending.advance(n);
                    self.bytes_written += n as u64;
                },
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(FlushStatus::Blocked),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("Gateway {}: write error: {}", self.index, e);
                    return Err(GatewayError::Io(e));
                },
            }
        }
        Ok(FlushStatus::Complete)
    }

    /// 是否还有未写出的字节
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// 丢弃未写出的字节（连接断开后使用）
    pub fn discard_pending(&mut self) -> usize {
        let n = self.pending.len();
        self.pending.clear();
        n
    }
}

impl Source for GatewayTx {
    fn register(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        self.stream.register(registry, token, interests)
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        self.stream.reregister(registry, token, interests)
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        self.stream.deregister(registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fpu_protocol::encode_frame;
    use std::net::TcpListener;
    use std::time::Instant;

    fn read_until(rx: &mut GatewayRx, want: usize) -> Vec<GatewayFrame> {
        let mut frames = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(2);
        while frames.len() < want && Instant::now() < deadline {
            let _ = rx.read_available(|f| frames.push(f)).unwrap();
            std::thread::sleep(Duration::from_millis(5));
        }
        frames
    }

    #[test]
    fn test_connect_refused_reports_error() {
        // 绑定后立即释放，端口上不再有监听者
        let port = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();
        let result = GatewayLink::connect(0, &format!("127.0.0.1:{port}"), Duration::from_millis(200));
        assert!(result.is_err());
    }

    #[test]
    fn test_unresolvable_address() {
        let result = GatewayLink::connect(0, "not an address", Duration::from_millis(100));
        assert!(matches!(result, Err(GatewayError::Resolve(_))));
    }

    #[test]
    fn test_split_halves_exchange_frames() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let link = GatewayLink::connect(1, &addr, Duration::from_secs(1)).unwrap();
        assert_eq!(link.index(), 1);
        let (mut peer, _) = listener.accept().unwrap();
        let (mut rx, mut tx) = link.split().unwrap();

        // 写半部 -> 对端
        let out = GatewayFrame::new(2, 0x0105, &[1, 7]);
        tx.queue_frame(&out);
        assert!(tx.has_pending());
        assert_eq!(tx.flush().unwrap(), FlushStatus::Complete);
        assert!(!tx.has_pending());

        let expected = encode_frame(&out);
        let mut got = vec![0u8; expected.len()];
        peer.read_exact(&mut got).unwrap();
        assert_eq!(got, expected);

        // 对端 -> 读半部（帧被拆成两次写入）
        let a = GatewayFrame::new(0, 0x0101, &[3, 7, 0, 0]);
        let b = GatewayFrame::new(4, 0x0110, &[0x10, 0x10]);
        let mut bytes = encode_frame(&a);
        bytes.extend(encode_frame(&b));
        let (first, second) = bytes.split_at(5);
        peer.write_all(first).unwrap();
        peer.flush().unwrap();
        std::thread::sleep(Duration::from_millis(10));
        peer.write_all(second).unwrap();

        assert_eq!(read_until(&mut rx, 2), vec![a, b]);
        assert_eq!(rx.dropped_frames(), 0);
    }

    #[test]
    fn test_peer_close_is_reported() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let link = GatewayLink::connect(0, &addr, Duration::from_secs(1)).unwrap();
        let (peer, _) = listener.accept().unwrap();
        let (mut rx, _tx) = link.split().unwrap();
        drop(peer);

        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            match rx.read_available(|_| {}) {
                Ok(ReadStatus::Closed { .. }) => break,
                Ok(ReadStatus::Drained { .. }) => {},
                Err(e) => {
                    assert!(e.is_connection_lost());
                    break;
                },
            }
            assert!(Instant::now() < deadline, "close not observed");
            std::thread::sleep(Duration::from_millis(5));
        }
    }
}
