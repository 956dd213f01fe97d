//! Timeout-tracked parameter database.
//!
//! Values arrive from bus-attached modules (charger, BMS, local sensors).
//! Each module carries a liveness counter ticked at 100 ms; when a module
//! times out, a one-shot console line is emitted and all of its parameters
//! revert to their defaults until the module is heard from again. Changed
//! values are reported to the console gated by a per-parameter hysteresis.
//!
//! The table is driven by static descriptor arrays indexed through the
//! `ModuleId`/`ParamId` handles, so applications declare their whole
//! parameter set as data.

use core::fmt;
use core::mem;

use crate::console::ReportSink;

/// Module liveness counter value meaning "timed out".
const DEAD: u8 = 255;

/// Typed parameter value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Value {
    Bool(bool),
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
}

impl Value {
    /// Numeric view used for hysteresis comparison. Booleans have none.
    fn as_i64(self) -> Option<i64> {
        match self {
            Value::Bool(_) => None,
            Value::I8(v) => Some(v.into()),
            Value::U8(v) => Some(v.into()),
            Value::I16(v) => Some(v.into()),
            Value::U16(v) => Some(v.into()),
            Value::I32(v) => Some(v.into()),
            Value::U32(v) => Some(v.into()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(v) => write!(f, "{}", *v as u8),
            Value::I8(v) => write!(f, "{}", v),
            Value::U8(v) => write!(f, "{}", v),
            Value::I16(v) => write!(f, "{}", v),
            Value::U16(v) => write!(f, "{}", v),
            Value::I32(v) => write!(f, "{}", v),
            Value::U32(v) => write!(f, "{}", v),
        }
    }
}

/// Handle to a module in the descriptor array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleId(pub usize);

/// Handle to a parameter in the descriptor array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamId(pub usize);

/// One source module: a name and a receive timeout. `timeout_ms` of 0 means
/// the module never times out.
pub struct ModuleDesc {
    pub name: &'static str,
    pub timeout_ms: u32,
}

/// One named parameter belonging to a module.
///
/// `report_hysteresis` of 0 disables reporting; booleans report on any
/// change regardless of the (nonzero) hysteresis value.
pub struct ParamDesc {
    pub module: ModuleId,
    pub name: &'static str,
    pub default: Value,
    pub report_hysteresis: u32,
}

/// Parameter table over static descriptor arrays.
///
/// Modules start out timed out; the first `reset_liveness()` brings them
/// alive. Single-threaded: all calls come from the 100 ms tick loop.
pub struct ParamTable<const M: usize, const P: usize> {
    modules: &'static [ModuleDesc; M],
    params: &'static [ParamDesc; P],
    counters: [u8; M],
    values: [Value; P],
    reported: [Value; P],
}

impl<const M: usize, const P: usize> ParamTable<M, P> {
    pub fn new(modules: &'static [ModuleDesc; M], params: &'static [ParamDesc; P]) -> Self {
        ParamTable {
            modules,
            params,
            counters: [DEAD; M],
            values: core::array::from_fn(|i| params[i].default),
            reported: core::array::from_fn(|i| params[i].default),
        }
    }

    /// Stores a new value. Does not touch module liveness.
    pub fn set(&mut self, param: ParamId, value: Value) {
        debug_assert!(
            mem::discriminant(&value) == mem::discriminant(&self.params[param.0].default),
            "type mismatch for parameter {}",
            self.params[param.0].name
        );
        self.values[param.0] = value;
    }

    pub fn get(&self, param: ParamId) -> Value {
        self.values[param.0]
    }

    pub fn alive(&self, module: ModuleId) -> bool {
        self.counters[module.0] != DEAD
    }

    /// Marks a module as just heard from.
    pub fn reset_liveness(&mut self, module: ModuleId) {
        self.counters[module.0] = 0;
    }

    /// Advances every module's liveness counter; call at a 100 ms interval.
    ///
    /// A module whose counter exceeds `timeout_ms / 100` saturates at the
    /// dead value, emitting a one-shot timed-out line. Parameters of dead
    /// modules are held at their defaults.
    pub fn tick_100ms(&mut self, sink: &mut impl ReportSink) {
        for (counter, module) in self.counters.iter_mut().zip(self.modules) {
            if module.timeout_ms == 0 || *counter == DEAD {
                continue;
            }
            *counter += 1;
            if u32::from(*counter) > module.timeout_ms / 100 {
                *counter = DEAD;
                sink.line(format_args!("-!- {} timed out", module.name));
            }
        }
        for (value, param) in self.values.iter_mut().zip(self.params) {
            if self.counters[param.module.0] == DEAD {
                *value = param.default;
            }
        }
    }

    /// Emits a `>> module_param = value` line for every parameter whose
    /// value has moved at least its hysteresis since last reported.
    pub fn report_if_changed(&mut self, sink: &mut impl ReportSink) {
        for i in 0..P {
            let param = &self.params[i];
            if param.report_hysteresis == 0 {
                continue;
            }
            let changed = match (self.values[i].as_i64(), self.reported[i].as_i64()) {
                (Some(now), Some(last)) => {
                    (now - last).unsigned_abs() >= u64::from(param.report_hysteresis)
                }
                _ => self.values[i] != self.reported[i],
            };
            if changed {
                self.reported[i] = self.values[i];
                self.report_one(i, sink);
            }
        }
    }

    /// Dumps every parameter regardless of hysteresis settings.
    pub fn report_all(&self, sink: &mut impl ReportSink) {
        for i in 0..P {
            self.report_one(i, sink);
        }
    }

    fn report_one(&self, i: usize, sink: &mut impl ReportSink) {
        let param = &self.params[i];
        sink.line(format_args!(
            ">> {}_{} = {}",
            self.modules[param.module.0].name, param.name, self.values[i]
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Lines(Vec<String>);

    impl ReportSink for Lines {
        fn line(&mut self, args: fmt::Arguments<'_>) {
            self.0.push(args.to_string());
        }
    }

    const MOD_CHARGER: ModuleId = ModuleId(0);
    const MOD_BMS: ModuleId = ModuleId(1);

    const PARAM_OUTPUT_VOLTAGE: ParamId = ParamId(0);
    const PARAM_CONTACTOR: ParamId = ParamId(1);
    const PARAM_SOC: ParamId = ParamId(2);

    static MODULES: [ModuleDesc; 2] = [
        ModuleDesc { name: "charger", timeout_ms: 500 },
        ModuleDesc { name: "bms", timeout_ms: 0 },
    ];

    static PARAMS: [ParamDesc; 3] = [
        ParamDesc {
            module: MOD_CHARGER,
            name: "output_voltage",
            default: Value::U16(0),
            report_hysteresis: 5,
        },
        ParamDesc {
            module: MOD_CHARGER,
            name: "contactor",
            default: Value::Bool(false),
            report_hysteresis: 1,
        },
        ParamDesc {
            module: MOD_BMS,
            name: "soc",
            default: Value::U8(0),
            report_hysteresis: 0,
        },
    ];

    fn table() -> ParamTable<2, 3> {
        ParamTable::new(&MODULES, &PARAMS)
    }

    #[test]
    fn modules_start_dead_and_revive_on_reset() {
        let mut table = table();
        assert!(!table.alive(MOD_CHARGER));
        table.reset_liveness(MOD_CHARGER);
        assert!(table.alive(MOD_CHARGER));
    }

    #[test]
    fn timeout_reverts_values_and_logs_once() {
        let mut table = table();
        let mut sink = Lines(Vec::new());

        table.reset_liveness(MOD_CHARGER);
        table.set(PARAM_OUTPUT_VOLTAGE, Value::U16(395));

        // 500 ms timeout = counter dies on the sixth tick
        for _ in 0..5 {
            table.tick_100ms(&mut sink);
        }
        assert!(table.alive(MOD_CHARGER));
        assert_eq!(table.get(PARAM_OUTPUT_VOLTAGE), Value::U16(395));
        assert!(sink.0.is_empty());

        table.tick_100ms(&mut sink);
        assert!(!table.alive(MOD_CHARGER));
        assert_eq!(table.get(PARAM_OUTPUT_VOLTAGE), Value::U16(0));
        assert_eq!(sink.0, vec!["-!- charger timed out"]);

        // The timed-out line is one-shot
        table.tick_100ms(&mut sink);
        assert_eq!(sink.0.len(), 1);
    }

    #[test]
    fn zero_timeout_module_never_dies() {
        let mut table = table();
        let mut sink = Lines(Vec::new());
        table.set(PARAM_SOC, Value::U8(80));
        for _ in 0..1000 {
            table.tick_100ms(&mut sink);
        }
        assert_eq!(table.get(PARAM_SOC), Value::U8(80));
        assert!(sink.0.is_empty());
    }

    #[test]
    fn reporting_is_hysteresis_gated() {
        let mut table = table();
        let mut sink = Lines(Vec::new());
        table.reset_liveness(MOD_CHARGER);

        table.set(PARAM_OUTPUT_VOLTAGE, Value::U16(3));
        table.report_if_changed(&mut sink);
        assert!(sink.0.is_empty());

        table.set(PARAM_OUTPUT_VOLTAGE, Value::U16(5));
        table.report_if_changed(&mut sink);
        assert_eq!(sink.0, vec![">> charger_output_voltage = 5"]);

        // Less than 5 V from the last report: quiet
        table.set(PARAM_OUTPUT_VOLTAGE, Value::U16(9));
        table.report_if_changed(&mut sink);
        assert_eq!(sink.0.len(), 1);
    }

    #[test]
    fn bools_report_on_any_change() {
        let mut table = table();
        let mut sink = Lines(Vec::new());
        table.set(PARAM_CONTACTOR, Value::Bool(true));
        table.report_if_changed(&mut sink);
        table.report_if_changed(&mut sink);
        assert_eq!(sink.0, vec![">> charger_contactor = 1"]);
    }

    #[test]
    fn zero_hysteresis_never_reports() {
        let mut table = table();
        let mut sink = Lines(Vec::new());
        table.set(PARAM_SOC, Value::U8(55));
        table.report_if_changed(&mut sink);
        assert!(sink.0.is_empty());
    }

    #[test]
    fn report_all_dumps_everything() {
        let table = table();
        let mut sink = Lines(Vec::new());
        table.report_all(&mut sink);
        assert_eq!(sink.0.len(), 3);
    }
}
