//! Charging session state machine.
//!
//! A twelve-state automaton sequencing one DC fast charge end to end: wait
//! for plug-in on the pilot lines, exchange parameters with the charger,
//! close the vehicle HV contactor at the right instant, servo the requested
//! current against the measured rail voltage, and bring the session down in
//! the timed multi-phase shutdown the standard requires.
//!
//! `update()` is called every 100 ms with a fresh [`Input`] snapshot;
//! received charger frames are fed in through [`Session::handle_can_frame`]
//! between ticks, and [`Session::send_can_frames`] emits the vehicle frames
//! from the same tick. Results land in the `output` member.

use log::{info, warn};

use crate::clock::{self, Every};
use crate::frames::{
    encode_vehicle_limits, encode_vehicle_state, encode_vehicle_time, ChargerFlags,
    ChargerStatus, VehicleConstant, VehicleFlags, VehicleStatus, ID_VEHICLE_LIMITS,
    ID_VEHICLE_STATE, ID_VEHICLE_TIME,
};

const REQUESTING_STOP_NICELY_TIMEOUT_MS: u32 = 40_000;
const REQUESTING_STOP_OPEN_CONTACTOR_TIMEOUT_MS: u32 = 20_000;
const CHARGER_CAN_TIMEOUT_MS: u32 = 5_000;
const CHARGE_END_HOLDOFF_MS: u32 = 180_000;
const VOLTAGE_SLOP_V: i16 = 2;
const INITIAL_CURRENT_REQUEST_A: u8 = 5;

/// Session phase, in protocol order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    /// Until d1 (seq 1 input) activates
    WaitingSeq1,
    /// Until we have valid parameters from the charger
    WaitingParameters,
    /// Until the BMS reports its main contactor closed
    WaitingBmsContactor,
    /// 0.5 s delay, then next state (IEEE 2030.1.1 A.6)
    PermittingCharge,
    /// Until d2 (seq 2 input) and connector lock activate after the
    /// insulation test; then close the contactor
    PermittingChargePhase2,
    /// Until the charger drops its "stopped" status and reports a charging
    /// time
    WaitingChargerToStartCharging,
    /// Until the battery is full or something else happens
    Charging,
    /// Until the current request has been ramped down to 0
    RequestingStopNicely,
    /// 1.75 s delay, then next state (IEEE 2030.1.1 A.6)
    RequestingStop,
    /// Until the charger reports <5 A current; then open the contactor
    RequestingStopPhase2,
    /// Until the charger reports the connector lock open
    WaitingConnectorUnlock,
    Ended,
}

/// Per-tick input snapshot, assembled fresh by the caller.
#[derive(Debug, Clone, Copy)]
pub struct Input {
    /// Seq 1 pilot line. High = 12 V (active), low = 0 V.
    pub d1_high: bool,
    /// Seq 2 pilot line. High = 12 V, low = 0 V (active).
    pub d2_high: bool,
    /// Connector presence. false = plugged in.
    pub conn_check_high: bool,
    /// Connector thermistors; -128 = not available.
    pub ntc1_celsius: i8,
    pub ntc2_celsius: i8,
    /// HV rail voltage measured by the vehicle outside of the battery.
    pub rail_voltage_v: i16,
    /// Pack voltage as reported by the BMS.
    pub bms_pack_voltage_v: i16,
    pub bms_main_contactor_closed: bool,
    /// Maximum charge current the BMS allows right now; 0 forbids charging.
    pub bms_max_charge_current_a: u8,
    pub bms_soc_percent: u8,
    pub vehicle_parked: bool,
}

impl Default for Input {
    fn default() -> Self {
        Input {
            d1_high: false,
            d2_high: false,
            conn_check_high: false,
            ntc1_celsius: -128,
            ntc2_celsius: -128,
            rail_voltage_v: 0,
            bms_pack_voltage_v: 0,
            bms_main_contactor_closed: false,
            bms_max_charge_current_a: 0,
            bms_soc_percent: 0,
            vehicle_parked: false,
        }
    }
}

/// Actuator requests derived from the session, read-only to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Output {
    /// Traction inverter must stay disabled (plugged in or HV tied to the
    /// inlet).
    pub disable_inverter: bool,
    /// Charge permission line to the charger.
    pub charging_enable: bool,
    /// Vehicle-side (inlet) HV contactor.
    pub close_c55demo_contactor: bool,
    /// Request for the BMS pack contactor to be closed.
    pub close_bms_contactor: bool,
}

impl Default for Output {
    fn default() -> Self {
        Output {
            disable_inverter: true,
            charging_enable: false,
            close_c55demo_contactor: false,
            close_bms_contactor: false,
        }
    }
}

/// One charging session. Construct once; the state machine re-arms itself
/// for the next plug-in after a completed or aborted session.
pub struct Session {
    target_charge_voltage_v: i16,
    charge_end_a: u8,

    state: SessionState,
    pub output: Output,
    pub vehicle_constant: VehicleConstant,
    pub vehicle_status: VehicleStatus,
    pub charger_status: ChargerStatus,

    // Timestamps in wall-ms; 0 = never
    started_at: u32,
    permitted_at: u32,
    contactor_closed_at: u32,
    stop_requested_at: u32,
    charger_voltage_ok_at: u32,
    bms_voltage_ok_at: u32,
    charger_heard_at: u32,
    request_adjusted_at: u32,

    // Rate limiters for the periodic console diagnostics
    log_seq1_discrepancy: Every,
    log_waiting_seq1: Every,
    log_waiting_parameters: Every,
    log_waiting_bms: Every,
    log_waiting_lock: Every,
    log_waiting_start: Every,
    log_ended: Every,
}

impl Session {
    pub const DEFAULT_CHARGE_END_A: u8 = 10;

    /// `target_charge_voltage_v` is the rail voltage the current servo holds;
    /// `charge_end_a` is the settled current request below which the session
    /// winds down (see `DEFAULT_CHARGE_END_A`).
    pub fn new(target_charge_voltage_v: i16, charge_end_a: u8) -> Self {
        let mut vehicle_constant = VehicleConstant::default();
        // Report slightly more than the servo target so the charger's own
        // limiter doesn't cut in right at the regulation point
        vehicle_constant.maximum_voltage = target_charge_voltage_v as u16 + 2;
        vehicle_constant.target_battery_voltage = target_charge_voltage_v as u16;

        Session {
            target_charge_voltage_v,
            charge_end_a,
            state: SessionState::WaitingSeq1,
            output: Output::default(),
            vehicle_constant,
            vehicle_status: VehicleStatus::default(),
            charger_status: ChargerStatus::default(),
            started_at: 0,
            permitted_at: 0,
            contactor_closed_at: 0,
            stop_requested_at: 0,
            charger_voltage_ok_at: 0,
            bms_voltage_ok_at: 0,
            charger_heard_at: 0,
            request_adjusted_at: 0,
            log_seq1_discrepancy: Every::new(1_000),
            log_waiting_seq1: Every::new(5_000),
            log_waiting_parameters: Every::new(5_000),
            log_waiting_bms: Every::new(5_000),
            log_waiting_lock: Every::new(5_000),
            log_waiting_start: Every::new(5_000),
            log_ended: Every::new(60_000),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// When seq 1 was first seen for the session in progress; 0 if never.
    pub fn started_at(&self) -> u32 {
        self.started_at
    }

    /// Feeds one received CAN frame into the charger snapshot.
    pub fn handle_can_frame(&mut self, id: u16, bytes: &[u8; 8], now: u32) {
        if self.charger_status.update_from_frame(id, bytes) {
            self.charger_heard_at = now;
        }
    }

    /// Emits the vehicle frames for this tick. Quiet until the session has
    /// seen seq 1, then exactly three frames per call.
    pub fn send_can_frames(&self, mut send: impl FnMut(u16, [u8; 8])) {
        if self.state == SessionState::WaitingSeq1 {
            return;
        }
        send(ID_VEHICLE_LIMITS, encode_vehicle_limits(&self.vehicle_constant));
        send(
            ID_VEHICLE_TIME,
            encode_vehicle_time(&self.vehicle_constant, &self.vehicle_status),
        );
        send(
            ID_VEHICLE_STATE,
            encode_vehicle_state(&self.vehicle_constant, &self.vehicle_status),
        );
    }

    /// Advances the session; call every 100 ms.
    pub fn update(&mut self, input: &Input, now: u32) {
        if !clock::younger_than(now, self.charger_heard_at, CHARGER_CAN_TIMEOUT_MS) {
            self.charger_status = ChargerStatus::default();

            if input.conn_check_high && self.state != SessionState::WaitingSeq1 {
                warn!("CAN and conn_check are inactive; resetting state");
                self.state = SessionState::WaitingSeq1;
                self.vehicle_status = VehicleStatus::default();
                self.output = Output::default();
            }
        }

        self.dispatch(input, now);

        self.vehicle_status.charged_rate = input.bms_soc_percent;

        self.output.disable_inverter = self.request_inverter_disable(input);
        self.output.close_bms_contactor = self.request_main_contactor();
    }

    fn dispatch(&mut self, input: &Input, now: u32) {
        use SessionState::*;

        match self.state {
            WaitingSeq1 => {
                if input.d1_high {
                    if !input.d2_high {
                        if self.log_seq1_discrepancy.due(now) {
                            warn!("d1 (seq1) activation detected");
                            warn!("* but (seq2) also is. Logical discrepancy, not starting");
                        }
                    } else {
                        info!("d1 (seq1) activation detected");
                        self.state = WaitingParameters;
                        self.started_at = now;
                        return;
                    }
                }

                if self.log_waiting_seq1.due(now) {
                    info!("... Waiting for d1 (seq1) activation");
                }
            }
            WaitingParameters => {
                if !input.d1_high {
                    info!("d1 (seq1) deactivation detected, waiting for it again");
                    self.state = WaitingSeq1;
                    return;
                }

                let charger_alive = self.charger_status.available_current >= 10
                    // Some units (efacec) never report an available current
                    // but do fill in the other fields
                    || self.charger_status.protocol_version != 0
                    || self.charger_status.remaining_charging_time_minutes > 0;

                if charger_alive && input.bms_max_charge_current_a != 0 {
                    self.state = WaitingBmsContactor;
                    return;
                }

                if self.log_waiting_parameters.due(now) {
                    if self.charger_status.available_current < 10 {
                        info!("... Waiting for charger available current >= 10A or some other indication of charger being alive");
                    }
                    if input.bms_max_charge_current_a == 0 {
                        info!("... Waiting for BMS to permit charge");
                    }
                }
            }
            WaitingBmsContactor => {
                if !input.d1_high {
                    info!("d1 (seq1) deactivation detected, waiting for it again");
                    self.state = WaitingSeq1;
                    return;
                }

                if input.bms_main_contactor_closed {
                    self.permit_charge(now);
                    return;
                }

                if self.log_waiting_bms.due(now) {
                    info!("... Waiting for BMS main contactor to close");
                }
            }
            PermittingCharge => {
                self.stop_charge_if_needed(input, now);
                if self.state != PermittingCharge {
                    return;
                }

                if clock::age(now, self.permitted_at) >= 500 {
                    // IEEE 2030.1.1 A.6: the vehicle charging enabled flag is
                    // set 0.0...1.0 s after the charge permission line
                    self.vehicle_status.status.insert(VehicleFlags::CHARGE_ENABLED);
                    self.state = PermittingChargePhase2;

                    info!("NOTE: Connector lock and insulation test should occur now.");
                    info!("NOTE: Then the charger should pull the seq 2 line down.");
                }
            }
            PermittingChargePhase2 => {
                self.stop_charge_if_needed(input, now);
                if self.state != PermittingChargePhase2 {
                    return;
                }

                // The charger runs its insulation test and locks the
                // connector before pulling seq 2 (active low) down
                if !input.d2_high
                    && self.charger_status.status.contains(ChargerFlags::CONNECTOR_LOCKED)
                {
                    self.close_contactor_and_start_charging(now);
                    return;
                }

                if self.log_waiting_lock.due(now) {
                    if !self.charger_status.status.contains(ChargerFlags::CONNECTOR_LOCKED) {
                        info!("... Waiting for connector lock");
                    }
                    if input.d2_high {
                        info!("... Waiting for seq2 to be pulled low");
                    }
                }
            }
            WaitingChargerToStartCharging => {
                self.stop_charge_if_needed(input, now);
                if self.state != WaitingChargerToStartCharging {
                    return;
                }

                // Request some current initially
                self.vehicle_status.charging_current_request = INITIAL_CURRENT_REQUEST_A;

                // Once the charger is no longer "stopped" and reports a
                // charging time, current can actually flow
                if !self.charger_status.status.contains(ChargerFlags::STOPPED)
                    && self.charger_status.remaining_charging_time_minutes > 0
                {
                    self.state = Charging;
                    return;
                }

                if self.charger_status.status.contains(ChargerFlags::STOPPED)
                    && self.charger_status.present_charging_current > 0
                {
                    warn!("Charger reports charging current and being STOPPED at the same time");
                    self.stop_charging(now);
                    return;
                }

                if self.log_waiting_start.due(now) {
                    if self.charger_status.status.contains(ChargerFlags::STOPPED) {
                        info!("... Waiting for charger status to not be STOPPED");
                    }
                    if self.charger_status.remaining_charging_time_minutes == 0 {
                        info!("... Waiting for charger to report a non-zero charging time");
                    }
                }
            }
            Charging => {
                self.stop_charge_if_needed(input, now);
                if self.state != Charging {
                    return;
                }

                self.run_current_servo(input, now);
            }
            RequestingStopNicely => {
                self.stop_charge_if_needed(input, now);
                if self.state != RequestingStopNicely {
                    return;
                }

                if clock::age(now, self.stop_requested_at) > REQUESTING_STOP_NICELY_TIMEOUT_MS {
                    warn!("Timed out requesting stop nicely. Requesting not nicely");
                    self.stop_charging(now);
                    return;
                }

                // Ramp the request down by 1 A per 100 ms tick
                if self.vehicle_status.charging_current_request > 0 {
                    self.vehicle_status.charging_current_request -= 1;
                }
                if self.vehicle_status.charging_current_request == 0 {
                    self.stop_charging(now);
                }
            }
            RequestingStop => {
                if clock::age(now, self.stop_requested_at) > 1_750 {
                    // IEEE 2030.1.1 A.6: the charge permission line
                    // deactivates 1.5...2.0 s after the CANbus stop flag
                    self.output.charging_enable = false;
                    self.state = RequestingStopPhase2;
                    self.stop_requested_at = now;
                }
            }
            RequestingStopPhase2 => {
                if clock::age(now, self.stop_requested_at)
                    > REQUESTING_STOP_OPEN_CONTACTOR_TIMEOUT_MS
                {
                    warn!("Timed out requesting stop. Opening contactor");
                    self.open_contactor_and_wait_for_unlock();
                    self.vehicle_status.status.insert(VehicleFlags::FAULT);
                    return;
                }

                // When the charger reports <5 A current after 7 s, open the
                // contactor
                // TODO: also cross-check our own current measurement here
                if self.charger_status.present_charging_current < 5
                    && clock::age(now, self.stop_requested_at) > 7_000
                {
                    self.open_contactor_and_wait_for_unlock();
                }
            }
            WaitingConnectorUnlock => {
                if !self.charger_status.status.contains(ChargerFlags::CONNECTOR_LOCKED) {
                    info!("Connector lock is inactive. Charging has ended.");
                    self.state = Ended;
                    // Forget the charger so a charger that keeps talking
                    // after a problem can't hold the session out of reset
                    self.charger_heard_at = 0;
                }
            }
            Ended => {
                if self.log_ended.due(now) {
                    info!("Charging has ended");
                }
            }
        }
    }

    /// Current request servo and the voltage cross-checks that ride on its
    /// 300 ms cadence.
    fn run_current_servo(&mut self, input: &Input, now: u32) {
        // The standard allows ramping at 20 A/s; one small step per 300 ms
        // stays well inside that
        if clock::age(now, self.request_adjusted_at) <= 300 {
            return;
        }
        self.request_adjusted_at = now;

        let mut max_request = input.bms_max_charge_current_a;

        // Don't believe a charger that reports 0 A available; some units
        // (efacec) do this while happily delivering current
        let charger_available = match self.charger_status.available_current {
            0 => 120,
            current => current,
        };
        if max_request > charger_available {
            max_request = charger_available;
        }

        let measured_voltage = input.rail_voltage_v;
        let request = self.vehicle_status.charging_current_request;

        self.vehicle_status.charging_current_request = if request > max_request {
            request.saturating_sub(2)
        } else if measured_voltage < self.target_charge_voltage_v - VOLTAGE_SLOP_V {
            if request < max_request {
                request + 1
            } else {
                request
            }
        } else if measured_voltage > self.target_charge_voltage_v {
            request.saturating_sub(2)
        } else {
            request
        };

        // A request settled this low, this long after the contactor closed,
        // means the battery no longer accepts meaningful current
        if self.vehicle_status.charging_current_request < self.charge_end_a
            && clock::age(now, self.contactor_closed_at) > CHARGE_END_HOLDOFF_MS
        {
            info!("Charge looks finished");
            self.stop_charging_nicely(now);
        }

        // Deviation between our rail measurement and the charger's reported
        // output; 10 V limit from IEEE 2030.1.1 table A.22
        let charger_deviation =
            i32::from(measured_voltage) - i32::from(self.charger_status.present_output_voltage);
        if charger_deviation.abs() <= 10 {
            self.charger_voltage_ok_at = now;
        }
        if clock::age(now, self.charger_voltage_ok_at) > 5_000 {
            warn!("Charger correct voltage timeout");
            self.stop_charging(now);
        }

        // The BMS pack voltage updates too slowly for direct feedback, so
        // only cross-check it
        let bms_deviation = i32::from(measured_voltage) - i32::from(input.bms_pack_voltage_v);
        if bms_deviation.abs() < 5 {
            self.bms_voltage_ok_at = now;
        }
        if clock::age(now, self.bms_voltage_ok_at) > 5_000 {
            warn!("BMS correct voltage timeout");
            self.stop_charging(now);
        }
    }

    /// Cross-cutting abort checks for the charging-adjacent states.
    fn stop_charge_if_needed(&mut self, input: &Input, now: u32) {
        use SessionState::*;

        if matches!(self.state, Charging | PermittingCharge | WaitingChargerToStartCharging) {
            if input.ntc1_celsius > 50 || input.ntc2_celsius > 50 {
                warn!("Connector over temperature");
                self.stop_charging(now);
            }
            if input.bms_max_charge_current_a == 0 || !input.bms_main_contactor_closed {
                warn!("BMS does not allow charging");
                self.stop_charging(now);
            }
        }

        if matches!(self.state, Charging | RequestingStopNicely) {
            // The charger raises CHARGING and clears STOPPED only after the
            // vehicle has closed its contactor; give it 5 s of grace
            if clock::age(now, self.contactor_closed_at) > 5_000 {
                if self.charger_status.status.contains(ChargerFlags::STOPPED) {
                    warn!("Charger status switched to \"stopped\"");
                    self.stop_charging(now);
                }
                if !self.charger_status.status.contains(ChargerFlags::CHARGING) {
                    warn!("Charger status switched to \"not charging\"");
                    self.stop_charging(now);
                }
            }
        }

        if self.charger_status.status.contains(ChargerFlags::MALFUNCTION) {
            warn!("Charger reports malfunction");
            self.stop_charging(now);
        }

        if !input.d1_high {
            if self.state == WaitingParameters {
                info!("d1 (seq1) deactivation detected, waiting for it again");
                self.state = WaitingSeq1;
            } else {
                warn!("d1 (seq1) deactivation detected, stopping charging");
                self.stop_charging(now);
            }
        }
    }

    /// True when the BMS pack contactor needs to be closed.
    fn request_main_contactor(&self) -> bool {
        // Contactor-saving failsafe: never drop the pack while the charger
        // still reports real current flowing
        if self.charger_status.present_charging_current > 5 {
            return true;
        }
        self.state >= SessionState::WaitingBmsContactor && self.state != SessionState::Ended
    }

    fn request_inverter_disable(&self, input: &Input) -> bool {
        !input.conn_check_high || self.request_main_contactor()
    }

    fn permit_charge(&mut self, now: u32) {
        info!("permit_charge()");

        self.output.charging_enable = true;
        self.permitted_at = now;
        self.state = SessionState::PermittingCharge;
    }

    fn close_contactor_and_start_charging(&mut self, now: u32) {
        info!("close_contactor_and_start_charging()");

        self.output.close_c55demo_contactor = true;
        self.vehicle_status.status.remove(VehicleFlags::CONTACTOR_OPEN);

        self.contactor_closed_at = now;
        self.charger_voltage_ok_at = now;
        self.bms_voltage_ok_at = now;

        self.state = SessionState::WaitingChargerToStartCharging;
    }

    fn stop_charging_nicely(&mut self, now: u32) {
        info!("stop_charging_nicely()");

        self.state = SessionState::RequestingStopNicely;
        self.stop_requested_at = now;
    }

    fn stop_charging(&mut self, now: u32) {
        info!("stop_charging()");

        self.vehicle_status.charging_current_request = 0;
        self.vehicle_status.status.remove(VehicleFlags::CHARGE_ENABLED);

        self.state = SessionState::RequestingStop;
        self.stop_requested_at = now;
    }

    fn open_contactor_and_wait_for_unlock(&mut self) {
        info!("open_contactor_and_start_waiting_for_connector_unlock()");

        self.output.close_c55demo_contactor = false;
        self.vehicle_status.status.insert(VehicleFlags::CONTACTOR_OPEN);
        self.vehicle_status.status.remove(VehicleFlags::CHARGE_ENABLED);

        self.state = SessionState::WaitingConnectorUnlock;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames::{ID_CHARGER_LIMITS, ID_CHARGER_STATE};

    const TICK_MS: u32 = 100;

    /// Session plus a simulated clock and a sticky input snapshot.
    struct Bench {
        session: Session,
        input: Input,
        now: u32,
    }

    impl Bench {
        fn new() -> Self {
            Bench {
                session: Session::new(400, Session::DEFAULT_CHARGE_END_A),
                input: Input::default(),
                now: 1_000,
            }
        }

        fn tick(&mut self) {
            self.now += TICK_MS;
            let input = self.input;
            self.session.update(&input, self.now);
        }

        fn tick_for(&mut self, ms: u32) {
            for _ in 0..ms / TICK_MS {
                self.tick();
            }
        }

        fn state(&self) -> SessionState {
            self.session.state()
        }

        fn request(&self) -> u8 {
            self.session.vehicle_status.charging_current_request
        }

        fn deliver_limits(&mut self, available_current: u8) {
            let bytes = [0x01, 0x90, 0x01, available_current, 0xa2, 0x01, 0, 0];
            self.session.handle_can_frame(ID_CHARGER_LIMITS, &bytes, self.now);
        }

        fn deliver_state(
            &mut self,
            output_voltage: u16,
            output_current: u8,
            status: ChargerFlags,
            remaining_min: u8,
        ) {
            let [vlo, vhi] = output_voltage.to_le_bytes();
            let bytes = [2, vlo, vhi, output_current, 0, status.bits(), 0, remaining_min];
            self.session.handle_can_frame(ID_CHARGER_STATE, &bytes, self.now);
        }

        /// Ticks `n` times, redelivering the same charger state before every
        /// tick so CAN liveness holds.
        fn tick_charging(
            &mut self,
            n: u32,
            output_voltage: u16,
            output_current: u8,
            status: ChargerFlags,
        ) {
            for _ in 0..n {
                self.deliver_state(output_voltage, output_current, status, 59);
                self.tick();
            }
        }

        /// Walks the happy path into `Charging`.
        fn start_charging(available_current: u8, bms_max: u8) -> Bench {
            let mut b = Bench::new();
            b.input.d1_high = true;
            b.input.d2_high = true;
            b.input.conn_check_high = false;
            b.input.rail_voltage_v = 390;
            b.input.bms_pack_voltage_v = 390;
            b.tick();
            assert_eq!(b.state(), SessionState::WaitingParameters);

            b.deliver_limits(available_current);
            b.deliver_state(0, 0, ChargerFlags::STOPPED, 0);
            b.input.bms_max_charge_current_a = bms_max;
            b.tick();
            assert_eq!(b.state(), SessionState::WaitingBmsContactor);

            b.input.bms_main_contactor_closed = true;
            b.tick();
            assert_eq!(b.state(), SessionState::PermittingCharge);
            assert!(b.session.output.charging_enable);

            b.tick_for(600);
            assert_eq!(b.state(), SessionState::PermittingChargePhase2);
            assert!(b
                .session
                .vehicle_status
                .status
                .contains(VehicleFlags::CHARGE_ENABLED));

            b.deliver_state(390, 0, ChargerFlags::CONNECTOR_LOCKED | ChargerFlags::STOPPED, 0);
            b.input.d2_high = false;
            b.tick();
            assert_eq!(b.state(), SessionState::WaitingChargerToStartCharging);
            assert!(b.session.output.close_c55demo_contactor);
            assert!(!b
                .session
                .vehicle_status
                .status
                .contains(VehicleFlags::CONTACTOR_OPEN));

            b.deliver_state(
                390,
                0,
                ChargerFlags::CONNECTOR_LOCKED | ChargerFlags::CHARGING,
                59,
            );
            b.tick();
            assert_eq!(b.state(), SessionState::Charging);
            assert_eq!(b.request(), INITIAL_CURRENT_REQUEST_A);

            b
        }
    }

    const RUNNING: ChargerFlags =
        ChargerFlags::CONNECTOR_LOCKED.union(ChargerFlags::CHARGING);

    #[test]
    fn idle_session_stays_idle() {
        let mut b = Bench::new();
        for _ in 0..50 {
            b.tick();
            assert_eq!(b.state(), SessionState::WaitingSeq1);
            assert_eq!(b.session.output.charging_enable, false);
            assert_eq!(b.session.output.close_c55demo_contactor, false);
        }
    }

    #[test]
    fn seq2_discrepancy_blocks_start() {
        let mut b = Bench::new();
        b.input.d1_high = true;
        b.input.d2_high = false; // seq 2 already pulled down: implausible
        b.tick_for(2_000);
        assert_eq!(b.state(), SessionState::WaitingSeq1);
    }

    #[test]
    fn happy_path_reaches_charging() {
        Bench::start_charging(20, 30);
    }

    #[test]
    fn seq1_drop_while_waiting_for_parameters_reverts() {
        let mut b = Bench::new();
        b.input.d1_high = true;
        b.input.d2_high = true;
        b.tick();
        assert_eq!(b.state(), SessionState::WaitingParameters);

        b.input.d1_high = false;
        b.tick();
        assert_eq!(b.state(), SessionState::WaitingSeq1);
    }

    #[test]
    fn charger_without_available_current_report_is_accepted() {
        // efacec-style: 0 A available but a protocol version is filled in
        let mut b = Bench::new();
        b.input.d1_high = true;
        b.input.d2_high = true;
        b.input.bms_max_charge_current_a = 30;
        b.tick();
        b.deliver_state(0, 0, ChargerFlags::STOPPED, 0);
        b.tick();
        assert_eq!(b.state(), SessionState::WaitingBmsContactor);
    }

    #[test]
    fn servo_ramps_up_and_saturates_at_charger_limit() {
        let mut b = Bench::start_charging(20, 30);

        // First adjustment fires on the first Charging tick
        b.tick_charging(1, 390, 6, RUNNING);
        assert_eq!(b.request(), 6);

        // 390 V stays below 400 - 2 V, so the request climbs to the
        // effective ceiling min(30, 20) and stays there
        for _ in 0..80 {
            b.tick_charging(1, 390, b.request(), RUNNING);
            assert!(b.request() <= 20);
        }
        assert_eq!(b.request(), 20);
        assert_eq!(b.state(), SessionState::Charging);
    }

    #[test]
    fn servo_tracks_lowered_bms_limit() {
        let mut b = Bench::start_charging(20, 30);
        for _ in 0..80 {
            b.tick_charging(1, 390, b.request(), RUNNING);
        }
        assert_eq!(b.request(), 20);

        // BMS pulls its envelope down: step down by 2 per adjustment
        b.input.bms_max_charge_current_a = 11;
        let mut seen_odd_step = false;
        for _ in 0..40 {
            b.tick_charging(1, 390, b.request(), RUNNING);
            seen_odd_step |= b.request() == 12;
        }
        // 20 -> 18 -> ... -> 12 -> 11 region, settling within the envelope
        assert!(b.request() <= 11);
        assert!(seen_odd_step);
    }

    #[test]
    fn servo_backs_off_above_target_voltage() {
        let mut b = Bench::start_charging(20, 30);
        b.tick_charging(1, 390, 6, RUNNING);
        assert_eq!(b.request(), 6);

        b.input.rail_voltage_v = 405;
        b.input.bms_pack_voltage_v = 405;
        let before = b.request();
        for _ in 0..10 {
            b.tick_charging(1, 405, b.request(), RUNNING);
            if b.request() != before {
                break;
            }
        }
        assert_eq!(b.request(), before - 2);
    }

    #[test]
    fn servo_holds_inside_slop_band() {
        let mut b = Bench::start_charging(20, 30);
        b.tick_charging(1, 390, 6, RUNNING);

        // 399 V is within [target - slop, target]: hold
        b.input.rail_voltage_v = 399;
        b.input.bms_pack_voltage_v = 399;
        let before = b.request();
        for _ in 0..20 {
            b.tick_charging(1, 399, b.request(), RUNNING);
        }
        assert_eq!(b.request(), before);
    }

    #[test]
    fn connector_temperature_boundary() {
        let mut b = Bench::start_charging(20, 30);

        b.input.ntc1_celsius = 50; // boundary: not a trip
        b.tick_charging(5, 390, 10, RUNNING);
        assert_eq!(b.state(), SessionState::Charging);

        b.input.ntc1_celsius = 51;
        b.tick_charging(1, 390, 10, RUNNING);
        assert_eq!(b.state(), SessionState::RequestingStop);
        assert_eq!(b.request(), 0);
    }

    #[test]
    fn bms_withdrawing_permission_stops_charge() {
        let mut b = Bench::start_charging(20, 30);
        b.input.bms_max_charge_current_a = 0;
        b.tick_charging(1, 390, 10, RUNNING);
        assert_eq!(b.state(), SessionState::RequestingStop);
        assert!(!b
            .session
            .vehicle_status
            .status
            .contains(VehicleFlags::CHARGE_ENABLED));
    }

    #[test]
    fn charger_malfunction_stops_charge() {
        let mut b = Bench::start_charging(20, 30);
        b.tick_charging(1, 390, 10, RUNNING | ChargerFlags::MALFUNCTION);
        assert_eq!(b.state(), SessionState::RequestingStop);
    }

    #[test]
    fn charger_voltage_deviation_trips_after_five_seconds() {
        let mut b = Bench::start_charging(20, 30);

        // Charger insists it outputs 20 V more than we measure
        b.tick_charging(60, 410, 10, RUNNING);
        assert_eq!(b.state(), SessionState::RequestingStop);
        assert_eq!(b.request(), 0);
        assert!(!b
            .session
            .vehicle_status
            .status
            .contains(VehicleFlags::CHARGE_ENABLED));
        // Permission line drops only 1.75 s into RequestingStop
        assert!(b.session.output.charging_enable);
    }

    #[test]
    fn ten_volt_deviation_is_still_tolerated() {
        let mut b = Bench::start_charging(20, 30);
        // Exactly 10 V apart: the cross-check keeps restamping
        b.tick_charging(70, 400, 10, RUNNING);
        assert_eq!(b.state(), SessionState::Charging);
    }

    #[test]
    fn bms_voltage_deviation_trips_after_five_seconds() {
        let mut b = Bench::start_charging(20, 30);
        b.input.bms_pack_voltage_v = 380; // 10 V from the rail; limit is <5
        b.tick_charging(60, 390, 10, RUNNING);
        assert_eq!(b.state(), SessionState::RequestingStop);
    }

    #[test]
    fn charger_going_quiet_resets_session_when_unplugged() {
        let mut b = Bench::start_charging(20, 30);

        // Cable yanked: seq 1 drops, connector check goes high, CAN dies
        b.input.d1_high = false;
        b.input.conn_check_high = true;
        b.tick_for(5_200);

        assert_eq!(b.state(), SessionState::WaitingSeq1);
        assert_eq!(b.session.charger_status, ChargerStatus::default());
        assert_eq!(
            b.session.vehicle_status.status,
            VehicleFlags::CONTACTOR_OPEN
        );
        assert_eq!(b.request(), 0);
        assert!(!b.session.output.charging_enable);
        assert!(!b.session.output.close_c55demo_contactor);
        assert!(!b.session.output.close_bms_contactor);
    }

    #[test]
    fn contactor_saving_failsafe_boundary() {
        let mut b = Bench::new();
        // No session at all, but the charger claims 6 A is flowing
        b.deliver_state(390, 6, ChargerFlags::empty(), 0);
        b.tick();
        assert_eq!(b.state(), SessionState::WaitingSeq1);
        assert!(b.session.output.close_bms_contactor);
        assert!(b.session.output.disable_inverter);

        // 5 A is not sufficient
        b.deliver_state(390, 5, ChargerFlags::empty(), 0);
        b.tick();
        assert!(!b.session.output.close_bms_contactor);
    }

    #[test]
    fn zero_available_current_is_treated_as_120() {
        let mut b = Bench::start_charging(0, 150);
        for _ in 0..600 {
            b.tick_charging(1, 390, b.request(), RUNNING);
            assert!(b.request() <= 120);
        }
        assert_eq!(b.request(), 120);
    }

    #[test]
    fn end_of_charge_winds_down_and_ends() {
        // BMS limits to 5 A, below the 10 A end threshold, so once the
        // 3-minute holdoff passes the session starts a nice stop
        let mut b = Bench::start_charging(20, 5);

        b.tick_charging(1_805, 390, 5, RUNNING);
        assert_eq!(b.state(), SessionState::RequestingStopNicely);

        // 5 A ramps to 0 in five ticks, then the hard stop begins
        b.tick_charging(5, 390, 5, RUNNING);
        assert_eq!(b.state(), SessionState::RequestingStop);
        assert_eq!(b.request(), 0);
        assert!(!b
            .session
            .vehicle_status
            .status
            .contains(VehicleFlags::CHARGE_ENABLED));
        assert!(b.session.output.charging_enable);

        // Charge permission drops 1.75 s later
        b.tick_charging(19, 390, 2, RUNNING);
        assert_eq!(b.state(), SessionState::RequestingStopPhase2);
        assert!(!b.session.output.charging_enable);

        // Charger winds its current below 5 A; contactor opens after 7 s
        b.tick_charging(72, 390, 2, RUNNING);
        assert_eq!(b.state(), SessionState::WaitingConnectorUnlock);
        assert!(!b.session.output.close_c55demo_contactor);
        assert!(b
            .session
            .vehicle_status
            .status
            .contains(VehicleFlags::CONTACTOR_OPEN));
        assert!(!b
            .session
            .vehicle_status
            .status
            .contains(VehicleFlags::FAULT));

        // Connector lock releases: session is over
        b.deliver_state(0, 0, ChargerFlags::empty(), 0);
        b.tick();
        assert_eq!(b.state(), SessionState::Ended);
        assert!(!b.session.output.close_bms_contactor);
    }

    #[test]
    fn stuck_shutdown_forces_contactor_open_with_fault() {
        let mut b = Bench::start_charging(20, 30);

        // Rail runs away: hard stop through the deviation check
        b.tick_charging(60, 420, 10, RUNNING);
        assert_eq!(b.state(), SessionState::RequestingStop);
        b.tick_charging(19, 420, 10, RUNNING);
        assert_eq!(b.state(), SessionState::RequestingStopPhase2);

        // Charger never drops below 5 A: the 20 s failsafe opens anyway
        b.tick_charging(201, 420, 10, RUNNING);
        assert_eq!(b.state(), SessionState::WaitingConnectorUnlock);
        assert!(!b.session.output.close_c55demo_contactor);
        assert!(b
            .session
            .vehicle_status
            .status
            .contains(VehicleFlags::FAULT));
    }

    #[test]
    fn frames_quiet_until_seq1_then_three_per_tick() {
        let mut b = Bench::new();
        let mut sent: Vec<u16> = Vec::new();
        b.session.send_can_frames(|id, _| sent.push(id));
        assert!(sent.is_empty());

        b.input.d1_high = true;
        b.input.d2_high = true;
        b.tick();
        b.session.send_can_frames(|id, _| sent.push(id));
        assert_eq!(sent, vec![0x100, 0x101, 0x102]);
    }

    #[test]
    fn emitted_state_frame_carries_live_values() {
        let mut b = Bench::start_charging(20, 30);
        b.input.bms_soc_percent = 86;
        b.tick_charging(1, 390, 6, RUNNING);

        let mut state_frame = [0u8; 8];
        b.session.send_can_frames(|id, bytes| {
            if id == 0x102 {
                state_frame = bytes;
            }
        });
        assert_eq!(state_frame[3], b.request());
        assert_eq!(
            VehicleFlags::from_bits_retain(state_frame[5]),
            b.session.vehicle_status.status
        );
        assert_eq!(state_frame[6], 86);
    }

    #[test]
    fn contactor_only_closed_in_live_states() {
        // P-style sweep: whenever the vehicle contactor is commanded closed,
        // the session is in one of the states allowed to hold it
        let mut b = Bench::start_charging(20, 30);
        for _ in 0..120 {
            b.tick_charging(1, 410, 10, RUNNING); // deviation trips mid-way
            if b.session.output.close_c55demo_contactor {
                assert!(
                    b.state() >= SessionState::WaitingChargerToStartCharging
                        && b.state() <= SessionState::RequestingStopPhase2
                );
            }
        }
    }
}
