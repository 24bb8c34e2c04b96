/// Host capability: report whether a pid currently exists. The lock manager
/// uses this to tell a busy lock from a stale one.
pub trait ProcessProbe: Send + Sync {
    fn is_alive(&self, pid: u32) -> bool;
}

impl<F> ProcessProbe for F
where
    F: Fn(u32) -> bool + Send + Sync,
{
    fn is_alive(&self, pid: u32) -> bool {
        self(pid)
    }
}
