//! The unix-socket accept loop. Grounded on `squalelistener.c`'s
//! `squale_listener_open` (unlink stale socket, bind, `listen(fd, 30)`,
//! `chmod 0777`) and `squale_listener_accept` (accept, emit new-client).
//! tokio's `UnixListener::bind` has no way to set the listen backlog, so
//! the socket is built manually with `libc` and handed over via
//! `UnixListener::from_std`.

use std::io;
use std::os::fd::{FromRawFd, OwnedFd};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::UnixListener as StdUnixListener;
use std::path::Path;

use tokio::net::{UnixListener, UnixStream};
use tracing::{info, warn};

/// Matches the original's hardcoded `listen(fd, 30)`.
const BACKLOG: i32 = 30;

pub fn bind(path: &Path) -> io::Result<UnixListener> {
    if path.exists() {
        std::fs::remove_file(path)?;
    }

    let fd = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };

    let path_bytes = path.as_os_str().as_encoded_bytes();
    if path_bytes.len() >= 108 {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "unix socket path too long"));
    }

    let mut addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
    for (dst, src) in addr.sun_path.iter_mut().zip(path_bytes.iter()) {
        *dst = *src as libc::c_char;
    }

    let addr_len = std::mem::size_of::<libc::sockaddr_un>() as libc::socklen_t;
    let rc = unsafe {
        libc::bind(
            std::os::fd::AsRawFd::as_raw_fd(&fd),
            &addr as *const libc::sockaddr_un as *const libc::sockaddr,
            addr_len,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }

    let rc = unsafe { libc::listen(std::os::fd::AsRawFd::as_raw_fd(&fd), BACKLOG) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }

    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o777))?;

    let std_listener = {
        use std::os::fd::IntoRawFd;
        unsafe { StdUnixListener::from_raw_fd(fd.into_raw_fd()) }
    };
    std_listener.set_nonblocking(true)?;

    UnixListener::from_std(std_listener)
}

/// Accepts connections until `shutdown` resolves, handing each to
/// `on_connect`. Errors from individual `accept` calls are logged and
/// do not stop the loop (mirrors `squale_listener_accept`'s behaviour of
/// warning and continuing on a failed `accept(2)`).
pub async fn accept_loop<F, Fut>(
    listener: UnixListener,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
    mut on_connect: F,
) where
    F: FnMut(UnixStream) -> Fut,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _addr)) => {
                        tokio::spawn(on_connect(stream));
                    },
                    Err(error) => {
                        warn!(%error, "failed to accept connection");
                    },
                }
            },
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("listener shutting down");
                    return;
                }
            },
        }
    }
}
