use std::io;
use std::mem;
use std::net::TcpListener;
use std::os::unix::io::FromRawFd;

fn close_on(fd: libc::c_int) -> io::Error {
    let err = io::Error::last_os_error();
    unsafe {
        libc::close(fd);
    }
    err
}

/// Binds a listening IPv4 socket with an explicit kernel backlog, which
/// `TcpListener::bind` cannot set. `SO_REUSEADDR` keeps restarts from
/// tripping over sockets in TIME_WAIT.
pub fn bind_with_backlog(port: u16, backlog: i32) -> io::Result<TcpListener> {
    unsafe {
        let fd = libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        let one: libc::c_int = 1;
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const libc::c_int as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        ) != 0
        {
            return Err(close_on(fd));
        }

        let mut addr: libc::sockaddr_in = mem::zeroed();
        addr.sin_family = libc::AF_INET as libc::sa_family_t;
        addr.sin_port = port.to_be();
        addr.sin_addr.s_addr = libc::INADDR_ANY;
        if libc::bind(
            fd,
            &addr as *const libc::sockaddr_in as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        ) != 0
        {
            return Err(close_on(fd));
        }

        if libc::listen(fd, backlog) != 0 {
            return Err(close_on(fd));
        }

        Ok(TcpListener::from_raw_fd(fd))
    }
}
