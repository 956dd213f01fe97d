#![no_std]

use defmt_brtt as _; // global logger

use panic_probe as _;

use stm32g4xx_hal as _; // memory layout

pub mod can_queue;
pub mod console;
pub mod hardware;

// Make some common type aliases for fugit Duration, Instant and Rate
// based on our firmware's 1ms tick period
pub type Duration = fugit::Duration<u32, 1, 1000>;
pub type Instant = fugit::Instant<u32, 1, 1000>;
pub type Rate = fugit::Rate<u32, 1, 1000>;

// same panicking *behavior* as `panic-probe` but doesn't print a panic message
// this prevents the panic message being printed *twice* when `defmt::panic` is invoked
#[defmt::panic_handler]
fn panic() -> ! {
    cortex_m::asm::udf()
}

defmt::timestamp!("{=u32}", {
    use rtic_monotonics::Monotonic;
    hardware::Mono::now().ticks() as u32
});

/// Terminates the application and makes `probe-rs` exit with exit-code = 0
pub fn exit() -> ! {
    loop {
        cortex_m::asm::bkpt();
    }
}
