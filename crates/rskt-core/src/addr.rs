use std::fmt;

/// A fabric endpoint: the component tag of a node plus a socket number that
/// is unique on that node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct SocketAddr {
    pub component_tag: u32,
    pub socket_number: u32,
}

impl SocketAddr {
    pub const fn new(component_tag: u32, socket_number: u32) -> Self {
        Self {
            component_tag,
            socket_number,
        }
    }

    /// True if the socket number is left for the daemon to choose.
    #[inline]
    pub fn is_unspecified(&self) -> bool {
        self.socket_number == 0
    }
}

impl fmt::Display for SocketAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ct{}:{}", self.component_tag, self.socket_number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(SocketAddr::new(5, 100).to_string(), "ct5:100");
    }

    #[test]
    fn test_unspecified() {
        assert!(SocketAddr::new(5, 0).is_unspecified());
        assert!(!SocketAddr::new(0, 7).is_unspecified());
    }
}
