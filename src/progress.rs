/// Progress update callbacks
///
/// Dump, erase and flash operations report their progress through this
/// trait. Units depend on the operation: bytes for dumps, sectors for erases
/// and write blocks for programming.
pub trait ProgressCallbacks {
    /// Initialize some progress report
    fn init(&mut self, addr: u32, total: usize);
    /// Update some progress report
    fn update(&mut self, current: usize);
    /// Finish some progress report
    fn finish(&mut self);
}
