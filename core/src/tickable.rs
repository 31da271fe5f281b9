/// Representation of X amount of ticks (cycles)
/// of the controller clock.
pub type Ticks = u64;

/// Anything that advances along with the controller clock, such as the
/// simulated bus backend.
pub trait Tickable {
    /// Advances by `ticks` cycles, returns the amount actually advanced.
    fn tick(&mut self, ticks: Ticks) -> Ticks;
}
