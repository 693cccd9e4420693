//! Descriptor passing over Unix stream sockets (`SCM_RIGHTS`).

use std::io;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};

use crate::constants::MAX_FDS_PER_READ;

/// What one `recvmsg` call produced.
#[derive(Debug)]
pub struct Received {
    /// Bytes written into the caller's buffer. `0` means EOF.
    pub len: usize,
    /// Descriptors from `SCM_RIGHTS` control messages, owned.
    pub fds: Vec<OwnedFd>,
    /// The kernel dropped control data (`MSG_CTRUNC`).
    pub truncated: bool,
}

/// Receive into `buf`, collecting any attached descriptors.
///
/// Errors are returned as-is, so a non-blocking socket yields
/// `WouldBlock` for the caller's readiness loop to handle.
pub fn recvmsg_fds(sock_fd: RawFd, buf: &mut [u8]) -> io::Result<Received> {
    let fd_size = std::mem::size_of::<libc::c_int>();
    let cmsg_space =
        unsafe { libc::CMSG_SPACE((fd_size * MAX_FDS_PER_READ) as u32) } as usize;
    let mut cmsg_buf = vec![0u8; cmsg_space];

    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };
    let mut msg = libc::msghdr {
        msg_name: std::ptr::null_mut(),
        msg_namelen: 0,
        msg_iov: &mut iov,
        msg_iovlen: 1,
        msg_control: cmsg_buf.as_mut_ptr() as *mut libc::c_void,
        msg_controllen: cmsg_buf.len() as _,
        msg_flags: 0,
    };

    #[cfg(target_os = "linux")]
    let flags = libc::MSG_CMSG_CLOEXEC;
    #[cfg(not(target_os = "linux"))]
    let flags = 0;

    let n = unsafe { libc::recvmsg(sock_fd, &mut msg, flags) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }

    // Take ownership of every descriptor first so none leak on any path.
    let mut fds = Vec::new();
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let data = libc::CMSG_DATA(cmsg);
                let count = ((*cmsg).cmsg_len as usize - libc::CMSG_LEN(0) as usize) / fd_size;
                for i in 0..count {
                    let fd: libc::c_int =
                        std::ptr::read_unaligned(data.add(i * fd_size) as *const libc::c_int);
                    fds.push(OwnedFd::from_raw_fd(fd));
                }
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }

    Ok(Received {
        len: n as usize,
        fds,
        truncated: msg.msg_flags & libc::MSG_CTRUNC != 0,
    })
}

/// Send `data` with `fd` attached.
///
/// Returns the number of bytes the kernel accepted; the descriptor rides
/// with the first of them. The sender keeps its own copy of `fd`.
pub fn send_with_fd(sock_fd: RawFd, data: &[u8], fd: RawFd) -> io::Result<usize> {
    let fd_size = std::mem::size_of::<libc::c_int>();
    let cmsg_space = unsafe { libc::CMSG_SPACE(fd_size as u32) } as usize;
    let mut cmsg_buf = vec![0u8; cmsg_space];

    let mut iov = libc::iovec {
        iov_base: data.as_ptr() as *mut libc::c_void,
        iov_len: data.len(),
    };
    let msg = libc::msghdr {
        msg_name: std::ptr::null_mut(),
        msg_namelen: 0,
        msg_iov: &mut iov,
        msg_iovlen: 1,
        msg_control: cmsg_buf.as_mut_ptr() as *mut libc::c_void,
        msg_controllen: cmsg_space as _,
        msg_flags: 0,
    };

    unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN(fd_size as u32) as _;
        let data_ptr = libc::CMSG_DATA(cmsg) as *mut libc::c_int;
        std::ptr::write_unaligned(data_ptr, fd);
    }

    #[cfg(target_os = "linux")]
    let flags = libc::MSG_NOSIGNAL;
    #[cfg(not(target_os = "linux"))]
    let flags = 0;

    let n = unsafe { libc::sendmsg(sock_fd, &msg, flags) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn test_fd_round_trip_refers_to_same_file() {
        let (a, b) = UnixStream::pair().unwrap();
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"through the socket").unwrap();

        let sent = send_with_fd(a.as_raw_fd(), b"x", file.as_raw_fd()).unwrap();
        assert_eq!(sent, 1);

        let mut buf = [0u8; 16];
        let got = recvmsg_fds(b.as_raw_fd(), &mut buf).unwrap();
        assert_eq!(got.len, 1);
        assert_eq!(&buf[..1], b"x");
        assert_eq!(got.fds.len(), 1);
        assert!(!got.truncated);

        let mut received = std::fs::File::from(got.fds.into_iter().next().unwrap());
        use std::io::Seek;
        received.seek(std::io::SeekFrom::Start(0)).unwrap();
        let mut text = String::new();
        received.read_to_string(&mut text).unwrap();
        assert_eq!(text, "through the socket");
    }

    #[test]
    fn test_plain_bytes_have_no_fds() {
        let (mut a, b) = UnixStream::pair().unwrap();
        a.write_all(b"hello").unwrap();
        let mut buf = [0u8; 16];
        let got = recvmsg_fds(b.as_raw_fd(), &mut buf).unwrap();
        assert_eq!(&buf[..got.len], b"hello");
        assert!(got.fds.is_empty());
    }

    #[test]
    fn test_eof_reads_zero() {
        let (a, b) = UnixStream::pair().unwrap();
        drop(a);
        let mut buf = [0u8; 4];
        assert_eq!(recvmsg_fds(b.as_raw_fd(), &mut buf).unwrap().len, 0);
    }

    #[test]
    fn test_nonblocking_empty_socket_would_block() {
        let (_a, b) = UnixStream::pair().unwrap();
        b.set_nonblocking(true).unwrap();
        let mut buf = [0u8; 4];
        let err = recvmsg_fds(b.as_raw_fd(), &mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }
}
