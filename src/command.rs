/// Enum representing control commands for the video reader.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ControlCommand {
    Pause,
    Resume,
    /// Ends the session after the current frame.
    Stop,
}
