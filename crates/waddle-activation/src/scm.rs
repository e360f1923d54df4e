//! `SCM_RIGHTS` framing for Unix-domain datagrams.
//!
//! The only place that builds or parses control messages. The notify
//! client uses [`send_datagram_with_fds`]; supervisors (and tests) use
//! [`recv_datagram_with_fds`] on the other end.

use std::io;
use std::mem;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

/// Send one datagram carrying `payload` and, if `fds` is non-empty, a
/// single `SCM_RIGHTS` control message with the fds in the given order.
///
/// `payload` may be empty. The fds stay open in the sender.
pub fn send_datagram_with_fds(
    socket: impl AsFd,
    payload: &[u8],
    fds: &[BorrowedFd<'_>],
) -> io::Result<usize> {
    let raw_fds: Vec<RawFd> = fds.iter().map(AsRawFd::as_raw_fd).collect();

    let mut iov = libc::iovec {
        iov_base: payload.as_ptr() as *mut libc::c_void,
        iov_len: payload.len(),
    };

    // SAFETY: zeroed msghdr is valid before assigning pointers.
    let mut msghdr: libc::msghdr = unsafe { mem::zeroed() };
    if !payload.is_empty() {
        msghdr.msg_iov = &mut iov;
        msghdr.msg_iovlen = 1;
    }

    // u64 backing keeps the buffer aligned for cmsghdr.
    let mut control: Vec<u64> = Vec::new();
    if !raw_fds.is_empty() {
        let data_len = mem::size_of_val(raw_fds.as_slice());
        let space = unsafe { libc::CMSG_SPACE(data_len as u32) } as usize;
        control.resize(space.div_ceil(mem::size_of::<u64>()), 0);

        msghdr.msg_control = control.as_mut_ptr().cast();
        msghdr.msg_controllen = space as _;

        // SAFETY: control buffer sized with CMSG_SPACE and owned here.
        let cmsg = unsafe { libc::CMSG_FIRSTHDR(&msghdr) };
        if cmsg.is_null() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "failed to allocate SCM_RIGHTS cmsg",
            ));
        }

        // SAFETY: cmsg points into `control` and `raw_fds` has exactly
        // `data_len` bytes.
        unsafe {
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len = libc::CMSG_LEN(data_len as u32) as _;
            std::ptr::copy_nonoverlapping(
                raw_fds.as_ptr(),
                libc::CMSG_DATA(cmsg).cast::<RawFd>(),
                raw_fds.len(),
            );
        }
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    let flags = libc::MSG_NOSIGNAL;
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    let flags = 0;

    // SAFETY: msghdr points to live iov/control buffers.
    let n = unsafe { libc::sendmsg(socket.as_fd().as_raw_fd(), &msghdr, flags) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

/// Receive one datagram into `buf`, collecting up to `max_fds` fds passed
/// with it.
///
/// Returns the payload length and the received fds in the order the
/// sender listed them. Received fds are close-on-exec. If the sender
/// attached more than `max_fds`, the ones that did arrive are closed and
/// an error is returned.
pub fn recv_datagram_with_fds(
    socket: impl AsFd,
    buf: &mut [u8],
    max_fds: usize,
) -> io::Result<(usize, Vec<OwnedFd>)> {
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr().cast(),
        iov_len: buf.len(),
    };

    let data_len = max_fds.max(1) * mem::size_of::<RawFd>();
    let space = unsafe { libc::CMSG_SPACE(data_len as u32) } as usize;
    let mut control = vec![0_u64; space.div_ceil(mem::size_of::<u64>())];

    // SAFETY: zeroed msghdr is valid before assigning pointers.
    let mut msghdr: libc::msghdr = unsafe { mem::zeroed() };
    msghdr.msg_iov = &mut iov;
    msghdr.msg_iovlen = 1;
    msghdr.msg_control = control.as_mut_ptr().cast();
    msghdr.msg_controllen = space as _;

    #[cfg(any(target_os = "linux", target_os = "android"))]
    let flags = libc::MSG_CMSG_CLOEXEC;
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    let flags = 0;

    // SAFETY: msghdr points to live iov/control buffers.
    let n = unsafe { libc::recvmsg(socket.as_fd().as_raw_fd(), &mut msghdr, flags) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }

    let fds = parse_fds(&msghdr);
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    for fd in &fds {
        crate::files::set_cloexec(fd.as_raw_fd())?;
    }

    if (msghdr.msg_flags & libc::MSG_CTRUNC) != 0 {
        drop(fds);
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "truncated SCM_RIGHTS control message",
        ));
    }

    Ok((n as usize, fds))
}

fn parse_fds(msghdr: &libc::msghdr) -> Vec<OwnedFd> {
    let mut out = Vec::new();
    // SAFETY: msghdr points at a valid control buffer owned by caller.
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(msghdr);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let cmsg_len = (*cmsg).cmsg_len as usize;
                let base_len = libc::CMSG_LEN(0) as usize;
                let count = cmsg_len.saturating_sub(base_len) / mem::size_of::<RawFd>();
                let data = libc::CMSG_DATA(cmsg).cast::<RawFd>();
                for i in 0..count {
                    // Received fds are new entries in our table; we own them.
                    out.push(OwnedFd::from_raw_fd(data.add(i).read_unaligned()));
                }
            }
            cmsg = libc::CMSG_NXTHDR(msghdr, cmsg);
        }
    }
    out
}
