use std::time::Duration;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    sync::Notify,
    time::timeout,
};

/// Ошибки постановки в исходящий буфер.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OutboundError {
    #[error("outbound buffer closed")]
    Closed,
    #[error("pending bytes {pending} exceed limit {max}")]
    BytesLimit { pending: usize, max: usize },
    #[error("pending messages {pending} exceed limit {max}")]
    MsgsLimit { pending: usize, max: usize },
}

/// Ошибки фоновой записи в сокет.
#[derive(Debug, Error)]
pub enum FlushError {
    #[error("write did not complete within {0:?}")]
    Deadline(Duration),
    #[error("write failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Ограниченный исходящий буфер сессии.
///
/// Издатели только дописывают байты под коротким мьютексом и никогда не
/// ждут сокет; запись выполняет отдельная задача [`Outbound::flush_loop`].
#[derive(Debug)]
pub struct Outbound {
    state: Mutex<OutboundState>,
    notify: Notify,
    max_bytes: usize,
    max_msgs: usize,
}

#[derive(Debug)]
struct OutboundState {
    buf: BytesMut,
    pending_msgs: usize,
    closed: bool,
}

impl Outbound {
    pub fn new(
        max_bytes: usize,
        max_msgs: usize,
    ) -> Self {
        Self {
            state: Mutex::new(OutboundState {
                buf: BytesMut::with_capacity(4096),
                pending_msgs: 0,
                closed: false,
            }),
            notify: Notify::new(),
            max_bytes,
            max_msgs,
        }
    }

    /// Ставит в очередь управляющую строку.
    pub fn push(
        &self,
        data: &[u8],
    ) -> Result<(), OutboundError> {
        self.push_with(false, |buf| buf.extend_from_slice(data))
    }

    /// Ставит в очередь сообщение, записанное замыканием.
    ///
    /// Если после записи буфер превышает лимиты, запись откатывается.
    pub fn push_msg<F>(
        &self,
        write: F,
    ) -> Result<(), OutboundError>
    where
        F: FnOnce(&mut BytesMut),
    {
        self.push_with(true, write)
    }

    fn push_with<F>(
        &self,
        is_msg: bool,
        write: F,
    ) -> Result<(), OutboundError>
    where
        F: FnOnce(&mut BytesMut),
    {
        let mut state = self.state.lock();
        if state.closed {
            return Err(OutboundError::Closed);
        }

        let mark = state.buf.len();
        write(&mut state.buf);

        if state.buf.len() > self.max_bytes {
            let pending = state.buf.len();
            state.buf.truncate(mark);
            return Err(OutboundError::BytesLimit {
                pending,
                max: self.max_bytes,
            });
        }
        if is_msg {
            if state.pending_msgs >= self.max_msgs {
                state.buf.truncate(mark);
                return Err(OutboundError::MsgsLimit {
                    pending: state.pending_msgs + 1,
                    max: self.max_msgs,
                });
            }
            state.pending_msgs += 1;
        }
        drop(state);

        self.notify.notify_one();
        Ok(())
    }

    /// Байт ожидает записи.
    pub fn pending_bytes(&self) -> usize {
        self.state.lock().buf.len()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Запрещает новые записи; накопленное будет дописано.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_one();
    }

    /// Запрещает новые записи и отбрасывает накопленное.
    pub fn abort(&self) {
        {
            let mut state = self.state.lock();
            state.closed = true;
            state.buf.clear();
            state.pending_msgs = 0;
        }
        self.notify.notify_one();
    }

    fn take(&self) -> Option<Option<Bytes>> {
        let mut state = self.state.lock();
        if state.buf.is_empty() {
            return if state.closed { None } else { Some(None) };
        }
        state.pending_msgs = 0;
        Some(Some(state.buf.split().freeze()))
    }

    /// Дописывает буфер в сокет, пока он не закрыт и не опустошён.
    ///
    /// Каждая запись ограничена `deadline`; возвращает количество
    /// записанных байт.
    pub async fn flush_loop<W>(
        &self,
        writer: &mut W,
        deadline: Duration,
    ) -> Result<u64, FlushError>
    where
        W: AsyncWrite + Unpin,
    {
        let mut written = 0u64;
        loop {
            match self.take() {
                None => break,
                Some(None) => self.notify.notified().await,
                Some(Some(chunk)) => {
                    match timeout(deadline, writer.write_all(&chunk)).await {
                        Ok(Ok(())) => written += chunk.len() as u64,
                        Ok(Err(e)) => return Err(FlushError::Io(e)),
                        Err(_) => return Err(FlushError::Deadline(deadline)),
                    }
                }
            }
        }
        writer.flush().await?;
        Ok(written)
    }
}

////////////////////////////////////////////////////////////////////////////////
// Тесты
////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::io::AsyncReadExt;

    use super::*;

    /// Тест проверяет лимит по байтам и откат частичной записи.
    #[test]
    fn test_bytes_limit_rolls_back() {
        let out = Outbound::new(8, 100);
        assert!(out.push(b"PING\r\n").is_ok());
        let err = out.push(b"PONG\r\n").unwrap_err();
        assert!(matches!(err, OutboundError::BytesLimit { max: 8, .. }));
        assert_eq!(out.pending_bytes(), 6);
    }

    /// Тест проверяет лимит по количеству сообщений.
    #[test]
    fn test_msgs_limit() {
        let out = Outbound::new(1024, 2);
        assert!(out.push_msg(|b| b.extend_from_slice(b"a")).is_ok());
        assert!(out.push_msg(|b| b.extend_from_slice(b"b")).is_ok());
        assert!(matches!(
            out.push_msg(|b| b.extend_from_slice(b"c")),
            Err(OutboundError::MsgsLimit { .. })
        ));
        // Управляющие строки не считаются сообщениями.
        assert!(out.push(b"PING\r\n").is_ok());
    }

    #[test]
    fn test_closed_rejects_writes() {
        let out = Outbound::new(1024, 10);
        out.close();
        assert_eq!(out.push(b"x"), Err(OutboundError::Closed));
    }

    /// Тест проверяет, что flush_loop дописывает буфер после close.
    #[tokio::test]
    async fn test_flush_drains_after_close() {
        let out = Arc::new(Outbound::new(1024, 10));
        let (mut client, mut server) = tokio::io::duplex(64);

        let writer = {
            let out = out.clone();
            tokio::spawn(async move { out.flush_loop(&mut server, Duration::from_secs(1)).await })
        };

        out.push(b"INFO {}\r\n").unwrap();
        out.push_msg(|b| b.extend_from_slice(b"MSG a 1 0\r\n\r\n")).unwrap();
        out.close();

        let written = writer.await.unwrap().unwrap();
        assert_eq!(written, 22);

        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        assert_eq!(&received[..], b"INFO {}\r\nMSG a 1 0\r\n\r\n");
    }

    /// Тест проверяет срабатывание дедлайна, если получатель не читает.
    #[tokio::test]
    async fn test_flush_deadline() {
        let out = Outbound::new(1 << 20, 10);
        let (_client, mut server) = tokio::io::duplex(16);

        out.push(&[b'x'; 1024]).unwrap();
        let err = out
            .flush_loop(&mut server, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, FlushError::Deadline(_)));
    }

    #[test]
    fn test_abort_discards_pending() {
        let out = Outbound::new(1024, 10);
        out.push(b"MSG").unwrap();
        out.abort();
        assert_eq!(out.pending_bytes(), 0);
        assert!(out.is_closed());
    }
}
