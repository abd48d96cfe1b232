//! Socket-option tuning for accepted and dialed connections.
//!
//! The readiness multiplexer itself is platform-abstracted by `mio`; the one
//! place this crate still talks to the OS directly is per-socket tuning
//! (buffer sizes, `TCP_NODELAY`, `TCP_QUICKACK`). Unix gets the full set via
//! `libc`; elsewhere only the portable options apply.

use std::io;

use mio::net::TcpStream;

use crate::config::SocketTuning;

/// Applies `tuning` to a connection. Options unsupported on the current
/// platform are skipped, not errors.
pub fn apply(stream: &TcpStream, tuning: &SocketTuning) -> io::Result<()> {
    stream.set_nodelay(tuning.tcp_nodelay)?;

    cfg_if::cfg_if! {
        if #[cfg(unix)] {
            use std::os::unix::io::AsRawFd;
            let fd = stream.as_raw_fd();
            if let Some(sz) = tuning.recv_buf {
                set_recv_buffer(fd, sz as i32)?;
            }
            if let Some(sz) = tuning.send_buf {
                set_send_buffer(fd, sz as i32)?;
            }
            #[cfg(any(target_os = "linux", target_os = "android"))]
            if tuning.tcp_quickack {
                // Best effort; older kernels may refuse it.
                let _ = set_tcp_quickack(fd, true);
            }
        }
    }

    Ok(())
}

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        use std::os::unix::io::RawFd;

        fn setsockopt_int(fd: RawFd, level: i32, name: i32, value: i32) -> io::Result<()> {
            let rc = unsafe {
                libc::setsockopt(
                    fd,
                    level,
                    name,
                    &value as *const i32 as *const libc::c_void,
                    std::mem::size_of::<i32>() as libc::socklen_t,
                )
            };
            if rc != 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }

        pub(crate) fn set_recv_buffer(fd: RawFd, size: i32) -> io::Result<()> {
            setsockopt_int(fd, libc::SOL_SOCKET, libc::SO_RCVBUF, size)
        }

        pub(crate) fn set_send_buffer(fd: RawFd, size: i32) -> io::Result<()> {
            setsockopt_int(fd, libc::SOL_SOCKET, libc::SO_SNDBUF, size)
        }

        #[cfg(any(target_os = "linux", target_os = "android"))]
        pub(crate) fn set_tcp_quickack(fd: RawFd, on: bool) -> io::Result<()> {
            setsockopt_int(fd, libc::IPPROTO_TCP, libc::TCP_QUICKACK, on as i32)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn apply_succeeds_on_a_live_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let std_stream = std::net::TcpStream::connect(addr).unwrap();
        std_stream.set_nonblocking(true).unwrap();
        let stream = TcpStream::from_std(std_stream);

        let tuning = SocketTuning {
            tcp_nodelay: true,
            tcp_quickack: true,
            recv_buf: Some(64 * 1024),
            send_buf: Some(64 * 1024),
        };
        apply(&stream, &tuning).unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn send_buffer_size_is_settable() {
        use std::os::unix::io::AsRawFd;
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let stream = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        set_send_buffer(stream.as_raw_fd(), 32 * 1024).unwrap();
    }
}
