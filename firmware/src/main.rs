#![no_main]
#![no_std]

use c55demo_fw as _;

#[rtic::app(
    device = stm32g4xx_hal::stm32,
    dispatchers = [USBWAKEUP, COMP1_2_3, COMP4_5_6, COMP7, SAI, I2C4_EV, I2C4_ER]
)]
mod app {
    use c55demo::params::{ModuleDesc, ModuleId, ParamDesc, ParamId, ParamTable, Value};
    use c55demo::session::{Input, Session};
    use c55demo_fw::can_queue::{self, RawFrame};
    use c55demo_fw::console::{self, ConsoleSink};
    use c55demo_fw::hardware;
    use c55demo_fw::hardware::Mono;
    use debouncr::debounce_stateful_5;
    use fugit::ExtU32;
    use rtic_monotonics::Monotonic;
    use stm32g4xx_hal::prelude::{InputPin, OutputPin, PinState};

    /// Rail voltage the current servo regulates towards.
    const TARGET_CHARGE_VOLTAGE_V: i16 = 400;
    /// Settled current request below which the session winds down.
    const CHARGE_END_A: u8 = Session::DEFAULT_CHARGE_END_A;

    // The parameter database: everything worth watching on the console,
    // grouped by source so stale sources fall back to safe defaults.
    const MOD_INPUTS: ModuleId = ModuleId(0);
    const MOD_BMS: ModuleId = ModuleId(1);
    const MOD_CHARGER: ModuleId = ModuleId(2);

    static MODULES: [ModuleDesc; 3] = [
        ModuleDesc { name: "inputs", timeout_ms: 0 },
        ModuleDesc { name: "bms", timeout_ms: 5_000 },
        ModuleDesc { name: "charger", timeout_ms: 5_000 },
    ];

    const P_D1: ParamId = ParamId(0);
    const P_D2: ParamId = ParamId(1);
    const P_CONN_CHECK: ParamId = ParamId(2);
    const P_BMS_CONTACTOR: ParamId = ParamId(3);
    const P_RAIL_VOLTAGE: ParamId = ParamId(4);
    const P_NTC1: ParamId = ParamId(5);
    const P_NTC2: ParamId = ParamId(6);
    const P_PACK_VOLTAGE: ParamId = ParamId(7);
    const P_MAX_CHARGE_CURRENT: ParamId = ParamId(8);
    const P_SOC: ParamId = ParamId(9);
    const P_CHARGER_VOLTAGE: ParamId = ParamId(10);
    const P_CHARGER_CURRENT: ParamId = ParamId(11);
    const P_CHARGER_STATUS: ParamId = ParamId(12);
    const P_CHARGER_AVAILABLE: ParamId = ParamId(13);
    const P_CHARGER_REMAINING: ParamId = ParamId(14);

    static PARAMS: [ParamDesc; 15] = [
        ParamDesc { module: MOD_INPUTS, name: "d1", default: Value::Bool(false), report_hysteresis: 1 },
        ParamDesc { module: MOD_INPUTS, name: "d2", default: Value::Bool(false), report_hysteresis: 1 },
        ParamDesc { module: MOD_INPUTS, name: "conn_check", default: Value::Bool(false), report_hysteresis: 1 },
        ParamDesc { module: MOD_INPUTS, name: "bms_contactor", default: Value::Bool(false), report_hysteresis: 1 },
        ParamDesc { module: MOD_INPUTS, name: "rail_voltage", default: Value::I16(0), report_hysteresis: 2 },
        ParamDesc { module: MOD_INPUTS, name: "ntc1", default: Value::I8(-128), report_hysteresis: 2 },
        ParamDesc { module: MOD_INPUTS, name: "ntc2", default: Value::I8(-128), report_hysteresis: 2 },
        ParamDesc { module: MOD_BMS, name: "pack_voltage", default: Value::I16(0), report_hysteresis: 2 },
        ParamDesc { module: MOD_BMS, name: "max_charge_current", default: Value::U8(0), report_hysteresis: 1 },
        ParamDesc { module: MOD_BMS, name: "soc", default: Value::U8(0), report_hysteresis: 1 },
        ParamDesc { module: MOD_CHARGER, name: "output_voltage", default: Value::U16(0), report_hysteresis: 2 },
        ParamDesc { module: MOD_CHARGER, name: "output_current", default: Value::U8(0), report_hysteresis: 1 },
        ParamDesc { module: MOD_CHARGER, name: "status", default: Value::U8(0), report_hysteresis: 1 },
        ParamDesc { module: MOD_CHARGER, name: "available_current", default: Value::U8(0), report_hysteresis: 1 },
        ParamDesc { module: MOD_CHARGER, name: "remaining_time", default: Value::U8(0), report_hysteresis: 1 },
    ];

    type Table = ParamTable<3, 15>;

    fn param_bool(table: &Table, id: ParamId) -> bool {
        matches!(table.get(id), Value::Bool(true))
    }

    fn param_u8(table: &Table, id: ParamId) -> u8 {
        match table.get(id) {
            Value::U8(v) => v,
            _ => 0,
        }
    }

    fn param_i16(table: &Table, id: ParamId) -> i16 {
        match table.get(id) {
            Value::I16(v) => v,
            _ => 0,
        }
    }

    /// BMS broadcasts on the vehicle bus, in the de-facto inverter/BMS CAN
    /// layout: 0x351 charge limits, 0x355 state of charge, 0x356 pack
    /// measurements.
    fn apply_bms_frame(table: &mut Table, frame: &RawFrame) {
        match frame.id {
            0x351 => {
                // Max charge current in 0.1 A/bit at bytes 2-3
                let deciamps = u16::from_le_bytes([frame.data[2], frame.data[3]]);
                table.set(P_MAX_CHARGE_CURRENT, Value::U8((deciamps / 10).min(255) as u8));
                table.reset_liveness(MOD_BMS);
            }
            0x355 => {
                let soc = u16::from_le_bytes([frame.data[0], frame.data[1]]);
                table.set(P_SOC, Value::U8(soc.min(100) as u8));
                table.reset_liveness(MOD_BMS);
            }
            0x356 => {
                // Pack voltage in 0.01 V/bit at bytes 0-1
                let centivolts = i16::from_le_bytes([frame.data[0], frame.data[1]]);
                table.set(P_PACK_VOLTAGE, Value::I16(centivolts / 100));
                table.reset_liveness(MOD_BMS);
            }
            _ => (),
        }
    }

    /// Debounced levels of the four discrete inputs.
    #[derive(Clone, Copy, Default)]
    pub struct DiscreteInputs {
        pub d1_high: bool,
        pub d2_high: bool,
        pub conn_check_high: bool,
        pub bms_contactor_closed: bool,
    }

    #[shared]
    struct Shared {
        inputs: DiscreteInputs,
        ccan_tx: can_queue::Tx<hardware::ChargerCan>,
        vcan_tx: can_queue::Tx<hardware::VehicleCan>,
    }

    #[local]
    struct Local {
        ccan_control: can_queue::Control<hardware::ChargerCan>,
        vcan_control: can_queue::Control<hardware::VehicleCan>,
        ccan_rx: can_queue::Rx,
        vcan_rx: can_queue::Rx,
        session: Session,
        table: Table,
        sensors: hardware::Sensors,
        actuators: hardware::Actuators,
        watchdog: stm32g4xx_hal::independent_watchdog::IndependentWatchdog,
        pilot_seq1: hardware::PilotSeq1Input,
        pilot_seq2: hardware::PilotSeq2Input,
        conn_check: hardware::ConnCheckInput,
        contactor_sense: hardware::ContactorSenseInput,
    }

    #[init]
    fn init(cx: init::Context) -> (Shared, Local) {
        defmt::info!("init");

        let hardware::Board {
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
        } = hardware::init(cx.core, cx.device);

        console::init(console);
        log::info!(
            "c55demo-fw {} starting, charge target {} V",
            env!("CARGO_PKG_VERSION"),
            TARGET_CHARGE_VOLTAGE_V
        );

        // Charger bus: only the two charger IDs reach software
        let (ccan_control, ccan_rx, ccan_tx) = can_queue::Control::init(
            ccan_config,
            &can_timing_500kbps,
            can_queue::dual_filter(
                c55demo::frames::ID_CHARGER_LIMITS,
                c55demo::frames::ID_CHARGER_STATE,
            ),
        );

        // Vehicle bus: the BMS broadcast block
        let (vcan_control, vcan_rx, vcan_tx) = can_queue::Control::init(
            vcan_config,
            &can_timing_500kbps,
            can_queue::range_filter(0x351, 0x356),
        );

        let session = Session::new(TARGET_CHARGE_VOLTAGE_V, CHARGE_END_A);

        let table = Table::new(&MODULES, &PARAMS);
        table.report_all(&mut ConsoleSink);

        poll_inputs::spawn().unwrap();
        tick::spawn().unwrap();

        (
            Shared {
                inputs: DiscreteInputs::default(),
                ccan_tx,
                vcan_tx,
            },
            Local {
                ccan_control,
                vcan_control,
                ccan_rx,
                vcan_rx,
                session,
                table,
                sensors,
                actuators,
                watchdog,
                pilot_seq1,
                pilot_seq2,
                conn_check,
                contactor_sense,
            },
        )
    }

    // The discrete inputs are slow, long wires into relay-land: poll them at
    // 100 Hz with debounce logic so the 100 ms tick sees clean levels
    #[task(
        shared = [inputs],
        local = [pilot_seq1, pilot_seq2, conn_check, contactor_sense],
        priority = 4
    )]
    async fn poll_inputs(mut cx: poll_inputs::Context) {
        let period = 10.millis();
        // Debouncers; each debounce period is (_N * period)
        let mut d1 = debounce_stateful_5(false);
        let mut d2 = debounce_stateful_5(false);
        let mut conn = debounce_stateful_5(false);
        let mut contactor = debounce_stateful_5(false);

        let mut next = Mono::now() + period;
        loop {
            Mono::delay_until(next).await;
            next += period;

            d1.update(cx.local.pilot_seq1.is_high().unwrap());
            d2.update(cx.local.pilot_seq2.is_high().unwrap());
            conn.update(cx.local.conn_check.is_high().unwrap());
            contactor.update(cx.local.contactor_sense.is_high().unwrap());

            cx.shared.inputs.lock(|inputs| {
                inputs.d1_high = d1.is_high();
                inputs.d2_high = d2.is_high();
                inputs.conn_check_high = conn.is_high();
                inputs.bms_contactor_closed = contactor.is_high();
            });
        }
    }

    // The session heartbeat: everything protocol-visible happens here, in
    // order, once per 100 ms
    #[task(
        shared = [inputs, ccan_tx],
        local = [ccan_rx, vcan_rx, session, table, sensors, actuators, watchdog],
        priority = 2
    )]
    async fn tick(mut cx: tick::Context) {
        let period = 100.millis();
        let mut next = Mono::now() + period;
        loop {
            Mono::delay_until(next).await;
            next += period;

            cx.local.watchdog.feed();

            let now_ms = Mono::now().ticks() as u32;
            let session = &mut *cx.local.session;
            let table = &mut *cx.local.table;

            // Drain the charger frames received since the last tick
            while let Ok(frame) = cx.local.ccan_rx.try_recv() {
                session.handle_can_frame(frame.id, &frame.data, now_ms);
                table.reset_liveness(MOD_CHARGER);
            }

            // And the BMS broadcasts from the vehicle bus
            while let Ok(frame) = cx.local.vcan_rx.try_recv() {
                apply_bms_frame(table, &frame);
            }

            // Liveness upkeep: stale sources revert to their (safe) defaults
            table.tick_100ms(&mut ConsoleSink);

            let discrete = cx.shared.inputs.lock(|inputs| *inputs);
            let input = Input {
                d1_high: discrete.d1_high,
                d2_high: discrete.d2_high,
                conn_check_high: discrete.conn_check_high,
                ntc1_celsius: cx.local.sensors.ntc1_celsius(),
                ntc2_celsius: cx.local.sensors.ntc2_celsius(),
                rail_voltage_v: cx.local.sensors.rail_voltage_v(),
                bms_pack_voltage_v: param_i16(table, P_PACK_VOLTAGE),
                bms_main_contactor_closed: discrete.bms_contactor_closed,
                bms_max_charge_current_a: param_u8(table, P_MAX_CHARGE_CURRENT),
                bms_soc_percent: param_u8(table, P_SOC),
                // No shifter input on this module; a DC session only starts
                // with the vehicle already parked and powered down
                vehicle_parked: true,
            };

            session.update(&input, now_ms);

            // Copy the session's requests onto the actuators
            let out = session.output;
            let actuators = &mut *cx.local.actuators;
            actuators.charge_enable.set_state(PinState::from(out.charging_enable)).unwrap();
            actuators.contactor.set_state(PinState::from(out.close_c55demo_contactor)).unwrap();
            actuators
                .bms_contactor_request
                .set_state(PinState::from(out.close_bms_contactor))
                .unwrap();
            actuators
                .inverter_disable
                .set_state(PinState::from(out.disable_inverter))
                .unwrap();
            actuators
                .led_contactor
                .set_state(PinState::from(out.close_c55demo_contactor))
                .unwrap();

            // Keep the inlet transceiver powered whenever a charger could be
            // on the other end of the cable
            let rail_on = !discrete.conn_check_high || discrete.d1_high;
            actuators.switched_rail.set_state(PinState::from(rail_on)).unwrap();

            // The vehicle frames ride the same tick as the state machine
            cx.shared.ccan_tx.lock(|tx| {
                session.send_can_frames(|id, data| tx.transmit(&RawFrame { id, data }));
            });

            // Mirror this tick's observations into the parameter table and
            // report what moved
            table.set(P_D1, Value::Bool(input.d1_high));
            table.set(P_D2, Value::Bool(input.d2_high));
            table.set(P_CONN_CHECK, Value::Bool(input.conn_check_high));
            table.set(P_BMS_CONTACTOR, Value::Bool(input.bms_main_contactor_closed));
            table.set(P_RAIL_VOLTAGE, Value::I16(input.rail_voltage_v));
            table.set(P_NTC1, Value::I8(input.ntc1_celsius));
            table.set(P_NTC2, Value::I8(input.ntc2_celsius));
            let charger = &session.charger_status;
            table.set(P_CHARGER_VOLTAGE, Value::U16(charger.present_output_voltage));
            table.set(P_CHARGER_CURRENT, Value::U8(charger.present_charging_current));
            table.set(P_CHARGER_STATUS, Value::U8(charger.status.bits()));
            table.set(P_CHARGER_AVAILABLE, Value::U8(charger.available_current));
            table.set(P_CHARGER_REMAINING, Value::U8(charger.remaining_charging_time_minutes));
            table.report_if_changed(&mut ConsoleSink);
        }
    }

    // FDCAN_INTR0_IT and FDCAN_INTR1_IT are swapped, until stm32g4 crate
    // updates to include https://github.com/stm32-rs/stm32-rs/pull/996
    #[task(binds = FDCAN1_INTR1_IT, shared = [ccan_tx], local = [ccan_control], priority = 6)]
    fn ccan_irq(cx: ccan_irq::Context) {
        cx.local.ccan_control.on_irq(cx.shared.ccan_tx);
    }

    #[task(binds = FDCAN2_INTR1_IT, shared = [vcan_tx], local = [vcan_control], priority = 6)]
    fn vcan_irq(cx: vcan_irq::Context) {
        cx.local.vcan_control.on_irq(cx.shared.vcan_tx);
    }
}
