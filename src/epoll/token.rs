/// Identifies one registration in a worker's `Epoll` instance.
///
/// A `Token` is the slot index of the `Interest` it names in the owning
/// worker's `Slab`; epoll hands it back verbatim in `epoll_event.u64`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Token(pub usize);

impl From<usize> for Token {
    #[inline]
    fn from(val: usize) -> Token {
        Token(val)
    }
}

impl From<Token> for usize {
    #[inline]
    fn from(val: Token) -> usize {
        val.0
    }
}
