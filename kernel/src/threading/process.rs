pub type Pid = u16;

/// What the pager needs from the thread that took a fault or made a system
/// call: who it belongs to, where its user stack pointer was, and a way to
/// end it when the fault cannot be resolved.
pub trait UserContext {
    fn pid(&self) -> Pid;
    /// The user `esp` saved on entry to the kernel.
    fn user_stack_pointer(&self) -> usize;
    /// Terminate the process with `status`. Does not return to user mode.
    fn kill(&self, status: i32);
}

/// Exit status of a process terminated by the kernel.
pub const KILLED_STATUS: i32 = -1;
