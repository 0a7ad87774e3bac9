//! Receiving a TUN descriptor from another process.
//!
//! A privileged helper opens the interface and passes the descriptor over a
//! Unix socket with `SCM_RIGHTS`, so the engine itself can run unprivileged.

use super::TunDevice;
use crate::error::{TunatError, TunatResult};
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::path::Path;
use tokio::io::Interest;
use tokio::net::UnixListener;

/// Listen on `path`, accept one connection, receive exactly one descriptor
/// and remove the socket file.
pub async fn receive_fd(path: &Path) -> TunatResult<OwnedFd> {
    let listener = UnixListener::bind(path).map_err(|e| {
        TunatError::TunDevice(format!("Failed to bind {}: {}", path.display(), e))
    })?;
    log::info!("Waiting for TUN descriptor on {}", path.display());

    let accepted = listener.accept().await;
    drop(listener);
    if let Err(e) = std::fs::remove_file(path) {
        log::warn!("Failed to remove {}: {}", path.display(), e);
    }
    let (stream, _) = accepted.map_err(|e| {
        TunatError::TunDevice(format!("Failed to accept on {}: {}", path.display(), e))
    })?;

    loop {
        stream.readable().await?;
        match stream.try_io(Interest::READABLE, || recv_single_fd(stream.as_raw_fd())) {
            Ok(fd) => return Ok(fd),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => {
                return Err(TunatError::TunDevice(format!(
                    "Failed to receive TUN descriptor: {}",
                    e
                )))
            }
        }
    }
}

/// Receive a descriptor on `path` and open it as a TUN device.
pub async fn open_from_socket(path: &Path) -> TunatResult<TunDevice> {
    let fd = receive_fd(path).await?;
    TunDevice::from_raw_fd(fd.into_raw_fd())
}

/// One `recvmsg` call that must carry exactly one control message holding
/// exactly one descriptor. Any descriptors received are closed on error.
fn recv_single_fd(socket: RawFd) -> io::Result<OwnedFd> {
    let mut data = [0u8; 1];
    let mut iov = libc::iovec {
        iov_base: data.as_mut_ptr().cast(),
        iov_len: data.len(),
    };

    // Room for several descriptors so extras are detected, not truncated
    let space = unsafe { libc::CMSG_SPACE((mem::size_of::<RawFd>() * 8) as u32) } as usize;
    let mut control = vec![0u8; space];

    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr().cast();
    msg.msg_controllen = control.len() as _;

    let n = unsafe { libc::recvmsg(socket, &mut msg, 0) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }

    let mut messages = 0;
    let mut fds = Vec::new();
    let mut cmsg = unsafe { libc::CMSG_FIRSTHDR(&msg) };
    while !cmsg.is_null() {
        messages += 1;
        let header = unsafe { &*cmsg };
        if header.cmsg_level == libc::SOL_SOCKET && header.cmsg_type == libc::SCM_RIGHTS {
            let data_len = header.cmsg_len as usize - unsafe { libc::CMSG_LEN(0) } as usize;
            let data = unsafe { libc::CMSG_DATA(cmsg) } as *const RawFd;
            for i in 0..data_len / mem::size_of::<RawFd>() {
                let fd = unsafe { std::ptr::read_unaligned(data.add(i)) };
                fds.push(unsafe { OwnedFd::from_raw_fd(fd) });
            }
        }
        cmsg = unsafe { libc::CMSG_NXTHDR(&msg, cmsg) };
    }

    if n == 0 && messages == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed before a descriptor was sent",
        ));
    }
    if msg.msg_flags & libc::MSG_CTRUNC != 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "control message truncated",
        ));
    }
    if messages != 1 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("expected 1 control message, got {}", messages),
        ));
    }
    if fds.len() != 1 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("expected 1 descriptor, got {}", fds.len()),
        ));
    }

    Ok(fds.remove(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Seek, Write};
    use std::os::unix::net::UnixStream;
    use std::path::PathBuf;
    use std::time::Duration;

    /// Send `fds` as one SCM_RIGHTS message.
    fn send_fds(stream: &UnixStream, fds: &[RawFd]) {
        let mut data = [0u8; 1];
        let mut iov = libc::iovec {
            iov_base: data.as_mut_ptr().cast(),
            iov_len: data.len(),
        };
        let payload = mem::size_of_val(fds) as u32;
        let mut control = vec![0u8; unsafe { libc::CMSG_SPACE(payload) } as usize];

        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        if !fds.is_empty() {
            msg.msg_control = control.as_mut_ptr().cast();
            msg.msg_controllen = control.len() as _;
            unsafe {
                let cmsg = libc::CMSG_FIRSTHDR(&msg);
                (*cmsg).cmsg_level = libc::SOL_SOCKET;
                (*cmsg).cmsg_type = libc::SCM_RIGHTS;
                (*cmsg).cmsg_len = libc::CMSG_LEN(payload) as _;
                std::ptr::copy_nonoverlapping(
                    fds.as_ptr(),
                    libc::CMSG_DATA(cmsg) as *mut RawFd,
                    fds.len(),
                );
            }
        }

        let n = unsafe { libc::sendmsg(stream.as_raw_fd(), &msg, 0) };
        assert_eq!(n, 1);
    }

    async fn connect_when_ready(path: PathBuf) -> UnixStream {
        for _ in 0..100 {
            if let Ok(stream) = UnixStream::connect(&path) {
                return stream;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("socket {} never appeared", path.display());
    }

    #[tokio::test]
    async fn test_receive_one_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tunat.sock");
        let receiver = tokio::spawn({
            let path = path.clone();
            async move { receive_fd(&path).await }
        });

        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"descriptor").unwrap();
        let stream = connect_when_ready(path.clone()).await;
        send_fds(&stream, &[file.as_raw_fd()]);

        let fd = receiver.await.unwrap().unwrap();
        let mut received = std::fs::File::from(fd);
        received.rewind().unwrap();
        let mut content = String::new();
        received.read_to_string(&mut content).unwrap();
        assert_eq!(content, "descriptor");

        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_rejects_missing_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tunat.sock");
        let receiver = tokio::spawn({
            let path = path.clone();
            async move { receive_fd(&path).await }
        });

        let stream = connect_when_ready(path).await;
        send_fds(&stream, &[]);

        assert!(matches!(
            receiver.await.unwrap(),
            Err(TunatError::TunDevice(_))
        ));
    }

    #[tokio::test]
    async fn test_rejects_two_descriptors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tunat.sock");
        let receiver = tokio::spawn({
            let path = path.clone();
            async move { receive_fd(&path).await }
        });

        let a = tempfile::tempfile().unwrap();
        let b = tempfile::tempfile().unwrap();
        let stream = connect_when_ready(path).await;
        send_fds(&stream, &[a.as_raw_fd(), b.as_raw_fd()]);

        assert!(matches!(
            receiver.await.unwrap(),
            Err(TunatError::TunDevice(_))
        ));
    }
}
