use smallvec::SmallVec;
use std::any::{Any, TypeId};
use std::os::fd::RawFd;
use std::sync::Arc;

/// Auxiliary data carried through an in-flight operation and recovered when
/// its completion is observed.
///
/// A context holds the fd of the operation plus a chain of caller-supplied
/// typed values. Attaching a value of a type that is already present shadows
/// the earlier value; attaching a fd always overwrites the previous one.
/// Cloning is cheap: values are shared, not copied.
#[derive(Clone, Default)]
pub struct Context {
    fd: Option<RawFd>,
    values: SmallVec<[(TypeId, Arc<dyn Any + Send + Sync>); 2]>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches `value`, shadowing any earlier value of the same type.
    #[must_use]
    pub fn with_value<T: Any + Send + Sync>(mut self, value: T) -> Self {
        // Prepend so that the most recently attached value of a type wins.
        self.values.insert(0, (TypeId::of::<T>(), Arc::new(value)));
        self
    }

    /// Returns the most recently attached value of type `T`, if any.
    pub fn value<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.values
            .iter()
            .find(|(id, _)| *id == TypeId::of::<T>())
            .and_then(|(_, v)| v.downcast_ref::<T>())
    }

    #[must_use]
    pub fn with_fd(mut self, fd: RawFd) -> Self {
        self.fd = Some(fd);
        self
    }

    /// The fd of the in-flight operation, or -1 when none was attached.
    pub fn fd(&self) -> RawFd {
        self.fd.unwrap_or(-1)
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("fd", &self.fd)
            .field("values", &self.values.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Token(u64);

    #[derive(Debug, PartialEq)]
    struct Label(&'static str);

    #[test]
    fn test_empty_lookup() {
        let ctx = Context::new();
        assert_eq!(ctx.value::<Token>(), None);
        assert_eq!(ctx.fd(), -1);
    }

    #[test]
    fn test_typed_lookup() {
        let ctx = Context::new().with_value(Token(7)).with_value(Label("a"));
        assert_eq!(ctx.value::<Token>(), Some(&Token(7)));
        assert_eq!(ctx.value::<Label>(), Some(&Label("a")));
    }

    #[test]
    fn test_same_type_shadows() {
        let ctx = Context::new().with_value(Token(1)).with_value(Token(2));
        assert_eq!(ctx.value::<Token>(), Some(&Token(2)));
    }

    #[test]
    fn test_fd_overwrites() {
        let ctx = Context::new().with_fd(3).with_fd(9);
        assert_eq!(ctx.fd(), 9);
    }

    #[test]
    fn test_clone_shares_values() {
        let ctx = Context::new().with_value(Token(42)).with_fd(5);
        let copy = ctx.clone();
        assert_eq!(copy.value::<Token>(), Some(&Token(42)));
        assert_eq!(copy.fd(), 5);
        // Shadowing on the clone leaves the original chain untouched.
        let copy = copy.with_value(Token(43));
        assert_eq!(copy.value::<Token>(), Some(&Token(43)));
        assert_eq!(ctx.value::<Token>(), Some(&Token(42)));
    }
}
