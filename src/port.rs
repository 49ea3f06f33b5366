//! Port contract: the environment-specific layer the kernel consumes
//! but does not implement.
//!
//! A real firmware crate implements [`Port`] against its MCU's timer,
//! interrupt controller and power-management peripherals. The test
//! suite in this crate implements it against a fake, manually-advanced
//! tick source so the six end-to-end scenarios can run on a host.

use bitflags::bitflags;

bitflags! {
    /// A small, board-defined set of gateable peripherals. The exact
    /// bit assignment is up to the port; the kernel only ever asks
    /// "is anything besides the tick source on?".
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Peripherals: u16 {
        const UART   = 0b0000_0001;
        const SPI    = 0b0000_0010;
        const I2C    = 0b0000_0100;
        const ADC    = 0b0000_1000;
        const PWM    = 0b0001_0000;
        const TIMER1 = 0b0010_0000;
        const TIMER2 = 0b0100_0000;
    }
}

/// Sleep mode the idle task may request of the port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SleepMode {
    /// Keep running; there is work (or an IRQ) to handle right now.
    Run,
    /// Clocks keep running but the CPU halts until the next interrupt.
    Idle,
    /// Minimum power; even the tick source is stopped.
    Deep,
}

/// Everything the kernel needs from its environment.
///
/// All methods are expected to be callable with interrupts masked and
/// to return quickly; none of them are suspension points.
pub trait Port {
    /// Ticks elapsed since the counter was last read. The counter is
    /// 16 bits and wraps; the kernel only ever reads "since last read"
    /// deltas, so wraparound is transparent.
    fn get_monotonic_tick_counter(&mut self) -> u16;

    /// Record that hardware has observed IRQ `irq_id`. Safe to call
    /// from interrupt context; idempotent until claimed.
    fn report_irq(&mut self, irq_id: u8);

    /// Test-and-clear whether `irq_id` has been reported since the
    /// last claim. Returns `true` exactly once per report.
    fn claim_irq(&mut self, irq_id: u8) -> bool;

    /// Peek (without clearing) whether any irq is currently reported.
    /// Used only by idle-task sleep-mode selection.
    fn any_irq_pending(&self) -> bool;

    /// Enable the given peripheral(s).
    fn enable(&mut self, peripherals: Peripherals);

    /// Disable the given peripheral(s).
    fn disable(&mut self, peripherals: Peripherals);

    /// Currently enabled peripherals (excluding the tick source, which
    /// is tracked separately).
    fn enabled_peripherals(&self) -> Peripherals;

    /// Enter the requested sleep mode. Returns once an interrupt (or,
    /// for `Run`, immediately) brings the CPU back.
    fn sleep(&mut self, mode: SleepMode);

    /// Reset the watchdog countdown.
    fn kick_watchdog(&mut self);

    /// Save the current global-interrupt-enabled state and mask
    /// interrupts. Must nest: pairs of save/restore calls may be
    /// interleaved arbitrarily deep.
    fn mask_interrupts_save(&mut self) -> bool;

    /// Restore the interrupt-enabled state captured by a matching
    /// `mask_interrupts_save`, re-enabling only if that call found
    /// interrupts enabled.
    fn mask_interrupts_restore(&mut self, was_enabled: bool);
}
