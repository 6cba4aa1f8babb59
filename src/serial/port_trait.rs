//! Trait abstraction for the sensor's byte link to enable testing
//!
//! Everything above this trait (synchronizer, controllers) only sees a
//! timeout-capable duplex byte stream with FTDI-style buffer control.

use async_trait::async_trait;
use std::io;
use std::time::Duration;

/// Byte-oriented duplex link to the sensor
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SensorLink: Send {
    /// Read up to `buf.len()` bytes
    ///
    /// Returns `Ok(0)` if nothing arrived within `timeout`.
    async fn read(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize>;

    /// Write all data to the link
    async fn write_all(&mut self, data: &[u8]) -> io::Result<()>;

    /// Flush the output buffer
    async fn flush(&mut self) -> io::Result<()>;

    /// Discard bytes received but not yet read
    async fn purge_rx(&mut self) -> io::Result<()>;

    /// Discard bytes written but not yet sent
    async fn purge_tx(&mut self) -> io::Result<()>;

    /// Reset the USB bridge
    async fn reset_device(&mut self) -> io::Result<()>;

    /// Bytes waiting in the receive queue
    async fn queued_bytes(&mut self) -> io::Result<usize>;
}

/// Time the bridge control lines are held low during a reset
const RESET_PULSE: Duration = Duration::from_millis(10);

/// Wrapper around tokio_serial::SerialStream that implements SensorLink
pub struct TokioSerialLink {
    port: tokio_serial::SerialStream,
}

impl TokioSerialLink {
    pub fn new(port: tokio_serial::SerialStream) -> Self {
        Self { port }
    }
}

#[async_trait]
impl SensorLink for TokioSerialLink {
    async fn read(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        use tokio::io::AsyncReadExt;
        match tokio::time::timeout(timeout, self.port.read(buf)).await {
            Ok(result) => result,
            Err(_elapsed) => Ok(0),
        }
    }

    async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        use tokio::io::AsyncWriteExt;
        self.port.write_all(data).await
    }

    async fn flush(&mut self) -> io::Result<()> {
        use tokio::io::AsyncWriteExt;
        self.port.flush().await
    }

    async fn purge_rx(&mut self) -> io::Result<()> {
        use tokio_serial::SerialPort;
        self.port
            .clear(tokio_serial::ClearBuffer::Input)
            .map_err(io::Error::from)
    }

    async fn purge_tx(&mut self) -> io::Result<()> {
        use tokio_serial::SerialPort;
        self.port
            .clear(tokio_serial::ClearBuffer::Output)
            .map_err(io::Error::from)
    }

    /// Pulse DTR/RTS, then drop whatever the bridge buffered
    async fn reset_device(&mut self) -> io::Result<()> {
        use tokio_serial::SerialPort;
        self.port
            .write_data_terminal_ready(false)
            .and_then(|_| self.port.write_request_to_send(false))
            .map_err(io::Error::from)?;
        tokio::time::sleep(RESET_PULSE).await;
        self.port
            .write_data_terminal_ready(true)
            .and_then(|_| self.port.write_request_to_send(true))
            .and_then(|_| self.port.clear(tokio_serial::ClearBuffer::All))
            .map_err(io::Error::from)
    }

    async fn queued_bytes(&mut self) -> io::Result<usize> {
        use tokio_serial::SerialPort;
        self.port
            .bytes_to_read()
            .map(|n| n as usize)
            .map_err(io::Error::from)
    }
}

#[cfg(test)]
pub mod mocks {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// Link that replays a fixed byte script and records writes
    ///
    /// Reads return at most `chunk` bytes; an exhausted script reads as a
    /// timeout. Clones share the script, so a test can keep feeding bytes.
    #[derive(Clone)]
    pub struct ScriptedLink {
        pub rx: Arc<Mutex<VecDeque<u8>>>,
        pub written_data: Arc<Mutex<Vec<Vec<u8>>>>,
        pub read_calls: Arc<Mutex<usize>>,
        pub chunk: usize,
    }

    impl ScriptedLink {
        pub fn new(bytes: Vec<u8>) -> Self {
            Self {
                rx: Arc::new(Mutex::new(bytes.into())),
                written_data: Arc::new(Mutex::new(Vec::new())),
                read_calls: Arc::new(Mutex::new(0)),
                chunk: 64,
            }
        }

        pub fn push_rx(&self, bytes: &[u8]) {
            self.rx.lock().unwrap().extend(bytes.iter().copied());
        }

        pub fn get_written_data(&self) -> Vec<Vec<u8>> {
            self.written_data.lock().unwrap().clone()
        }

        pub fn read_calls(&self) -> usize {
            *self.read_calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl SensorLink for ScriptedLink {
        async fn read(&mut self, buf: &mut [u8], _timeout: Duration) -> io::Result<usize> {
            *self.read_calls.lock().unwrap() += 1;
            let n = {
                let mut rx = self.rx.lock().unwrap();
                let n = buf.len().min(rx.len()).min(self.chunk);
                for slot in buf.iter_mut().take(n) {
                    *slot = rx.pop_front().unwrap();
                }
                n
            };
            if n == 0 {
                // Let other tasks feed the script
                tokio::task::yield_now().await;
            }
            Ok(n)
        }

        async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
            self.written_data.lock().unwrap().push(data.to_vec());
            Ok(())
        }

        async fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }

        async fn purge_rx(&mut self) -> io::Result<()> {
            self.rx.lock().unwrap().clear();
            Ok(())
        }

        async fn purge_tx(&mut self) -> io::Result<()> {
            Ok(())
        }

        async fn reset_device(&mut self) -> io::Result<()> {
            Ok(())
        }

        async fn queued_bytes(&mut self) -> io::Result<usize> {
            Ok(self.rx.lock().unwrap().len())
        }
    }

    #[tokio::test]
    async fn test_scripted_link_chunks_and_times_out() {
        let mut link = ScriptedLink::new((0u8..100).collect());
        let mut buf = [0u8; 80];

        assert_eq!(link.read(&mut buf, Duration::ZERO).await.unwrap(), 64);
        assert_eq!(link.read(&mut buf, Duration::ZERO).await.unwrap(), 36);
        assert_eq!(buf[0], 64);
        assert_eq!(link.read(&mut buf, Duration::ZERO).await.unwrap(), 0);
        assert_eq!(link.read_calls(), 3);
    }

    #[tokio::test]
    async fn test_mock_link_write_error() {
        let mut link = MockSensorLink::new();
        link.expect_write_all()
            .returning(|_| Err(io::Error::new(io::ErrorKind::TimedOut, "Mock write error")));

        let err = link.write_all(&[0x12]).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }
}
