// "Board level" hardware abstractions, ie pin assignments, etc.
//
// The inlet control module: three discrete inputs from the charge inlet, one
// hardwired contactor aux-contact input, relay/FET outputs for the charge
// permission line and the HV contactors, a resistor-divider ADC channel for
// the HV rail, two connector thermistors, one CAN interface towards the
// charger and one towards the vehicle, and the diagnostic console UART.

use can_bit_timings;
use defmt::info;
use fdcan::ConfigMode;
use fdcan::FdCan;
use fugit::ExtU32;
use fugit::RateExtU32;
use hal::gpio::gpioa;
use hal::gpio::gpiob;
use hal::gpio::gpioc;
use hal::gpio::gpiod;
use hal::gpio::Analog;
use hal::gpio::Floating;
use hal::gpio::Input;
use hal::gpio::Output;
use hal::gpio::PushPull;
use stm32g4xx_hal as hal;
use stm32g4xx_hal::adc::config::SampleTime;
use stm32g4xx_hal::adc::{self, AdcClaim, ClockSource};
use stm32g4xx_hal::can::CanExt;
use stm32g4xx_hal::delay::DelayFromCountDownTimer;
use stm32g4xx_hal::gpio::GpioExt;
use stm32g4xx_hal::gpio::Speed;
use stm32g4xx_hal::pwr::PwrExt;
use stm32g4xx_hal::rcc;
use stm32g4xx_hal::rcc::{PllConfig, RccExt};
use stm32g4xx_hal::serial::{FullConfig, SerialExt};
use stm32g4xx_hal::stm32;
use stm32g4xx_hal::time::U32Ext;
use stm32g4xx_hal::timer::Timer;
use stm32g4xx_hal::independent_watchdog::IndependentWatchdog;

// Type aliases for hardware peripherals
pub type ChargerCan = hal::can::Can<hal::stm32::FDCAN1>;
pub type VehicleCan = hal::can::Can<hal::stm32::FDCAN2>;

// Type aliases for I/O pins

// IN1 => seq 1 pilot line (12V, active high)
pub type PilotSeq1Input = gpioc::PC9<Input<Floating>>;

// IN2 => seq 2 pilot line (12V, active low)
pub type PilotSeq2Input = gpiob::PB8<Input<Floating>>;

// IN3 => connector presence check (low = plugged in)
pub type ConnCheckInput = gpiob::PB9<Input<Floating>>;

// IN13 => BMS main contactor aux contact (5V, high = closed)
pub type ContactorSenseInput = gpiod::PD2<Input<Floating>>;

// OUT1 => charge permission relay to the charger
pub type ChargeEnableOutput = gpioa::PA4<Output<PushPull>>;

// OUT2 => inlet HV contactor driver
pub type ContactorOutput = gpiob::PB0<Output<PushPull>>;

// RELAY L1 => "close the pack contactors" request to the BMS
pub type BmsContactorRequestOutput = gpiob::PB6<Output<PushPull>>;

// OUT5 => traction inverter disable signal
pub type InverterDisableOutput = gpioc::PC3<Output<PushPull>>;

// RELAY H => switched 5V rail for the inlet-side CAN transceiver
pub type SwitchedRailOutput = gpioc::PC5<Output<PushPull>>;

// LED1 => contactor closed indication
pub type LedContactorOutput = gpiob::PB10<Output<PushPull>>;

/// Diagnostic console UART (115200 8N1 on the service connector).
pub type ConsoleUart = hal::serial::Serial<stm32::USART2, FullConfig>;

/// HV rail divider, high and low side (ohms). 450 V lands around 2.96 V at
/// the ADC pin.
const RAIL_DIVIDER_TOP: u32 = 499_000;
const RAIL_DIVIDER_BOTTOM: u32 = 3_300;

/// 10k NTC (B=3435) against a 10k pull-up to the 3.3 V rail, millivolts at
/// the tap versus connector temperature.
const NTC_TABLE: &[(u16, i8)] = &[
    (2875, -20),
    (2671, -10),
    (2413, 0),
    (2117, 10),
    (1806, 20),
    (1497, 30),
    (1215, 40),
    (969, 50),
    (765, 60),
    (599, 70),
    (472, 80),
    (371, 90),
];

/// The analog inputs: HV rail divider plus the two connector thermistors.
pub struct Sensors {
    adc: adc::Adc<stm32::ADC1, adc::Configured>,
    rail_pin: gpioa::PA0<Analog>,
    ntc1_pin: gpioa::PA1<Analog>,
    ntc2_pin: gpioc::PC0<Analog>,
}

impl Sensors {
    /// HV rail voltage on the vehicle side of the inlet contactor.
    pub fn rail_voltage_v(&mut self) -> i16 {
        let sample = self.adc.convert(&self.rail_pin, SampleTime::Cycles_640_5);
        let mv = u32::from(self.adc.sample_to_millivolts(sample));
        (mv * (RAIL_DIVIDER_TOP + RAIL_DIVIDER_BOTTOM) / RAIL_DIVIDER_BOTTOM / 1000) as i16
    }

    pub fn ntc1_celsius(&mut self) -> i8 {
        let sample = self.adc.convert(&self.ntc1_pin, SampleTime::Cycles_640_5);
        ntc_celsius(self.adc.sample_to_millivolts(sample))
    }

    pub fn ntc2_celsius(&mut self) -> i8 {
        let sample = self.adc.convert(&self.ntc2_pin, SampleTime::Cycles_640_5);
        ntc_celsius(self.adc.sample_to_millivolts(sample))
    }
}

/// Thermistor tap voltage to degrees, linearly interpolated between table
/// entries. Out-of-range readings (open or shorted probe) report -128,
/// which the session treats as "no thermistor fitted".
fn ntc_celsius(mv: u16) -> i8 {
    if mv > 3_100 || mv < 150 {
        return -128;
    }
    let mut prev = NTC_TABLE[0];
    if mv >= prev.0 {
        return prev.1;
    }
    for &(table_mv, table_c) in &NTC_TABLE[1..] {
        if mv >= table_mv {
            let span_mv = i32::from(prev.0 - table_mv);
            let span_c = i32::from(table_c - prev.1);
            let offset = i32::from(prev.0 - mv);
            return (i32::from(prev.1) + span_c * offset / span_mv) as i8;
        }
        prev = (table_mv, table_c);
    }
    NTC_TABLE[NTC_TABLE.len() - 1].1
}

/// The discrete actuator outputs, grouped so the tick task can own them as
/// one resource.
pub struct Actuators {
    pub charge_enable: ChargeEnableOutput,
    pub contactor: ContactorOutput,
    pub bms_contactor_request: BmsContactorRequestOutput,
    pub inverter_disable: InverterDisableOutput,
    pub switched_rail: SwitchedRailOutput,
    pub led_contactor: LedContactorOutput,
}

// Struct to encompass all the board resources, as their functions
pub struct Board {
    pub ccan_config: FdCan<ChargerCan, ConfigMode>,
    pub vcan_config: FdCan<VehicleCan, ConfigMode>,
    pub can_timing_500kbps: can_bit_timings::CanBitTiming,
    pub console: ConsoleUart,
    pub sensors: Sensors,
    pub actuators: Actuators,
    pub watchdog: IndependentWatchdog,
    pub pilot_seq1: PilotSeq1Input,
    pub pilot_seq2: PilotSeq2Input,
    pub conn_check: ConnCheckInput,
    pub contactor_sense: ContactorSenseInput,
}

// Systick Based Timer
pub const MONOTONIC_FREQUENCY: u32 = 1_000;
rtic_monotonics::systick_monotonic!(Mono, MONOTONIC_FREQUENCY);

// Hardware init function
pub fn init(core: cortex_m::Peripherals, dp: stm32::Peripherals) -> Board {
    info!("hardware init");

    let rcc = dp.RCC.constrain();

    // Sysclock is based on PLL_R
    let pll_config = PllConfig {
        mux: rcc::PllSrc::HSE(24_u32.MHz()), // 24 MHz crystal
        n: rcc::PllNMul::MUL_32,
        m: rcc::PllMDiv::DIV_3,       // f(vco) = 24MHz*32/3 = 256MHz
        r: Some(rcc::PllRDiv::DIV_2), // f(sysclock) = 256MHz/2 = 128MHz
        q: None,
        p: None,
    };

    let clock_config = rcc::Config::default()
        .pll_cfg(pll_config)
        .clock_src(rcc::SysClockSrc::PLL)
        .ahb_psc(rcc::Prescaler::NotDivided)
        .apb1_psc(rcc::Prescaler::Div2)
        .apb2_psc(rcc::Prescaler::Div2);

    let pwr = dp.PWR.constrain().freeze();
    let mut rcc = rcc.freeze(clock_config, pwr);

    // After clock configuration, the following should be true:
    // Sysclock is 128MHz
    // AHB clock is 128MHz
    // APB1 clock is 64MHz
    // APB2 clock is 64MHz

    Mono::start(core.SYST, rcc.clocks.sys_clk.to_Hz());

    unsafe {
        let flash = &(*stm32::FLASH::ptr());
        flash.acr.modify(|_, w| {
            w.latency().bits(0b1000) // 8 wait states
        });
    }

    let gpioa = dp.GPIOA.split(&mut rcc);
    let gpiob = dp.GPIOB.split(&mut rcc);
    let gpioc = dp.GPIOC.split(&mut rcc);
    let gpiod = dp.GPIOD.split(&mut rcc);

    assert!(rcc.clocks.apb1_clk.to_MHz() == 64); // Macro requires literal
    let can_timing_500kbps = can_bit_timings::can_timings!(64.mhz(), 500.khz());

    // CAN1: charger (inlet) bus
    let ccan_config = {
        let rx = gpioa.pa11.into_alternate().set_speed(Speed::VeryHigh);
        let tx = gpioa.pa12.into_alternate().set_speed(Speed::VeryHigh);
        dp.FDCAN1.fdcan(tx, rx, &rcc)
    };

    // CAN2: vehicle (application) bus, carries the BMS broadcasts
    let vcan_config = {
        let rx = gpiob.pb12.into_alternate().set_speed(Speed::VeryHigh);
        let tx = gpiob.pb13.into_alternate().set_speed(Speed::VeryHigh);
        dp.FDCAN2.fdcan(tx, rx, &rcc)
    };

    // Console on the service connector
    let console = {
        let tx = gpioa.pa2.into_alternate();
        let rx = gpioa.pa3.into_alternate();
        dp.USART2
            .usart(tx, rx, FullConfig::default().baudrate(115200.bps()), &mut rcc)
            .unwrap()
    };

    // ADC1 for the rail divider and thermistors. The claim sequence needs a
    // delay provider; SYST belongs to the monotonic, so borrow TIM6.
    let sensors = {
        let timer6 = Timer::new(dp.TIM6, &rcc.clocks);
        let mut adc_delay = DelayFromCountDownTimer::new(timer6.start_count_down(100.ms()));
        let adc = dp
            .ADC1
            .claim(ClockSource::SystemClock, &rcc, &mut adc_delay, true);
        Sensors {
            adc,
            rail_pin: gpioa.pa0.into_analog(),
            ntc1_pin: gpioa.pa1.into_analog(),
            ntc2_pin: gpioc.pc0.into_analog(),
        }
    };

    // Discrete inputs
    let pilot_seq1 = gpioc.pc9.into_floating_input();
    let pilot_seq2 = gpiob.pb8.into_floating_input();
    let conn_check = gpiob.pb9.into_floating_input();
    let contactor_sense = gpiod.pd2.into_floating_input();

    // Actuator outputs; all low (safe) on reset
    let actuators = Actuators {
        charge_enable: gpioa.pa4.into_push_pull_output(),
        contactor: gpiob.pb0.into_push_pull_output(),
        bms_contactor_request: gpiob.pb6.into_push_pull_output(),
        inverter_disable: gpioc.pc3.into_push_pull_output(),
        switched_rail: gpioc.pc5.into_push_pull_output(),
        led_contactor: gpiob.pb10.into_push_pull_output(),
    };

    // A missed tick means the session timing can no longer be trusted:
    // let the watchdog pull the whole module down instead
    let watchdog = {
        let mut wd = IndependentWatchdog::new(dp.IWDG);
        wd.start(500.millis());
        wd
    };

    Board {
        ccan_config,
        vcan_config,
        can_timing_500kbps,
        console,
        sensors,
        actuators,
        watchdog,
        pilot_seq1,
        pilot_seq2,
        conn_check,
        contactor_sense,
    }
}
