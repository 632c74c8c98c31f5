//! Safe TCP bind/connect/write helper functions.

use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr};

use crate::utils::FedError;

use bytes::BytesMut;

use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::time::{self, Duration};

/// Sends the bytes staged in `write_buf` to TCP writable connection
/// `conn_write`, starting from `write_buf_cursor`. Returns:
///   - `Ok(true)` if everything staged has been written; the buffer is
///     cleared and the cursor reset
///   - `Ok(false)` if socket full and may block; the remaining bytes stay in
///     the buffer and the caller retries once the socket is writable
///   - `Err(err)` if any unexpected error occurs
///
/// DEADLOCK AVOIDANCE: we avoid using `write_all()` here because, in the case
/// of TCP buffers being full, if both ends of the connection are trying to
/// write, they may both be blocking, resulting in a circular deadlock.
pub(crate) fn safe_tcp_write<Conn>(
    write_buf: &mut BytesMut,
    write_buf_cursor: &mut usize,
    conn_write: &Conn,
) -> Result<bool, FedError>
where
    Conn: AsRef<TcpStream>,
{
    // try until the staged bytes are all written
    while *write_buf_cursor < write_buf.len() {
        match conn_write
            .as_ref()
            .try_write(&write_buf[*write_buf_cursor..])
        {
            Ok(n) => {
                *write_buf_cursor += n;
            }
            Err(ref err) if err.kind() == ErrorKind::WouldBlock => {
                return Ok(false);
            }
            Err(err) => return Err(err.into()),
        }
    }

    // everything written, clear write_buf
    write_buf.clear();
    *write_buf_cursor = 0;

    Ok(true)
}

/// Wrapper over tokio `TcpListener::bind()` that provides a retrying logic.
pub(crate) async fn tcp_bind_with_retry(
    bind_addr: SocketAddr,
    mut retries: u8,
) -> Result<TcpListener, FedError> {
    loop {
        let socket = TcpSocket::new_v4()?;
        socket.set_reuseaddr(true)?;

        let bind_addr: SocketAddr =
            (Ipv4Addr::UNSPECIFIED, bind_addr.port()).into();
        let attempt = socket.bind(bind_addr).and_then(|_| socket.listen(1024));
        match attempt {
            Ok(listener) => return Ok(listener),
            Err(err) => {
                if retries == 0 {
                    return logged_err!(
                        "binding {} failed: {}",
                        bind_addr,
                        err
                    );
                }
                retries -= 1;
                time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

/// Wrapper over tokio `TcpStream::connect()` bounded by a timeout. Accepts
/// host names as well as literal addresses.
pub(crate) async fn tcp_connect_with_timeout(
    host: &str,
    port: u16,
    timeout: Duration,
) -> Result<TcpStream, FedError> {
    let stream =
        time::timeout(timeout, TcpStream::connect((host, port))).await??;
    stream.set_nodelay(true)?;
    Ok(stream)
}
