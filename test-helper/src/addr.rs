use std::net::{SocketAddr, TcpListener};

/// Gets a new socket address allocated by the OS.
pub fn get_unused_addr() -> SocketAddr {
    let socket = TcpListener::bind("127.0.0.1:0").unwrap();
    socket.local_addr().unwrap()
}

/// Gets `n` distinct socket addresses allocated by the OS.
///
/// All listeners are held until every address is allocated so the
/// OS cannot hand out the same port twice.
pub fn get_unused_addrs(n: usize) -> Vec<SocketAddr> {
    let sockets = (0..n)
        .map(|_| TcpListener::bind("127.0.0.1:0").unwrap())
        .collect::<Vec<_>>();
    sockets.iter().map(|s| s.local_addr().unwrap()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_unused_addr() {
        let addr = get_unused_addr();
        TcpListener::bind(addr).expect("Connect to allocated address");
    }

    #[test]
    fn test_get_unused_addrs_are_distinct() {
        let mut addrs = get_unused_addrs(4);
        addrs.sort();
        addrs.dedup();
        assert_eq!(addrs.len(), 4);
    }
}
