//! Component I — derived observables: `TimeIntegral` and free-form
//! `MathExpression`.
//!
//! Both are driven the same way: the owner hands them every update that
//! touches a variable they care about and they publish back onto the same
//! `ObservableBus`. Grounded on component A's subscribe/publish shape;
//! `MathExpr` is the external-collaborator seam Design Note §9 calls for
//! ("the core only requires `parse(text) -> {variables(), evaluate(bindings)}`)
//! — no expression-parser crate is pulled in, the trait is the boundary.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::observable::ObservableBus;

/// Running trapezoidal integral of `source_key`, published under `name`
/// on the same bus (spec.md §4.I).
pub struct TimeIntegral {
    source_key: String,
    name: String,
    accumulator: f64,
    last: Option<(DateTime<Utc>, f64)>,
}

impl TimeIntegral {
    #[must_use]
    pub fn new(source_key: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            source_key: source_key.into(),
            name: name.into(),
            accumulator: 0.0,
            last: None,
        }
    }

    /// Back-fills from whatever history already exists since `since`,
    /// using a trapezoidal rule over consecutive samples, publishing one
    /// update per historical sample (spec.md §4.I "on start").
    pub fn backfill(&mut self, bus: &mut ObservableBus, since: DateTime<Utc>) {
        let samples = bus.get_updates(&self.source_key, Some(since), None);
        let mut prev: Option<(DateTime<Utc>, f64)> = self.last;
        for sample in &samples {
            let v = sample.value.as_f64().unwrap_or(0.0);
            if let Some((t_prev, v_prev)) = prev {
                let dt = seconds_between(t_prev, sample.timestamp);
                self.accumulator += dt * (v_prev + v) / 2.0;
            }
            prev = Some((sample.timestamp, v));
            bus.update_one(self.name.clone(), self.accumulator);
        }
        self.last = prev;
    }

    /// Live path: advance by `(t - t_prev) * value` and publish (spec.md
    /// §4.I "thereafter"). Non-numeric samples contribute zero.
    pub fn on_new_sample(&mut self, bus: &mut ObservableBus, timestamp: DateTime<Utc>, value: Option<f64>) {
        let v = value.unwrap_or(0.0);
        if let Some((t_prev, _)) = self.last {
            let dt = seconds_between(t_prev, timestamp);
            self.accumulator += dt * v;
        }
        self.last = Some((timestamp, v));
        bus.update_one(self.name.clone(), self.accumulator);
    }
}

fn seconds_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    to.signed_duration_since(from).num_milliseconds() as f64 / 1000.0
}

/// The external-collaborator seam for the math-expression engine (Design
/// Note §9). The core never parses expression text itself.
pub trait MathExpr: Send + Sync {
    fn variables(&self) -> Vec<String>;
    fn evaluate(&self, bindings: &HashMap<String, f64>) -> Option<f64>;
}

/// Free-form math expression over other observables on the same bus
/// (spec.md §4.I).
pub struct MathExpression {
    name: String,
    expr: Arc<dyn MathExpr>,
    last_timestamp: Option<DateTime<Utc>>,
}

impl MathExpression {
    #[must_use]
    pub fn new(name: impl Into<String>, expr: Arc<dyn MathExpr>) -> Self {
        Self {
            name: name.into(),
            expr,
            last_timestamp: None,
        }
    }

    /// Called whenever `updated_name` changes on `bus`. Only a change to a
    /// referenced variable re-evaluates; missing bindings or a
    /// not-newer timestamp are silently skipped (spec.md §4.I).
    pub fn on_update(&mut self, bus: &mut ObservableBus, updated_name: &str, timestamp: DateTime<Utc>) {
        let variables = self.expr.variables();
        if !variables.iter().any(|v| v == updated_name) {
            return;
        }
        if self.last_timestamp.is_some_and(|last| timestamp <= last) {
            return;
        }

        let mut bindings = HashMap::new();
        for var in &variables {
            match bus.get_latest(var) {
                Ok(sample) => match sample.value.as_f64() {
                    Some(v) => {
                        bindings.insert(var.clone(), v);
                    }
                    None => return,
                },
                Err(_) => return,
            }
        }

        if let Some(result) = self.expr.evaluate(&bindings) {
            self.last_timestamp = Some(timestamp);
            bus.update_one(self.name.clone(), result);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_integral_live_updates_match_seed_scenario() {
        // spec.md §8 seed scenario 4: (0,0),(1,10),(2,10) -> 0, 10, 20.
        let mut bus = ObservableBus::new("reactor");
        let mut integral = TimeIntegral::new("flow", "volume");
        let t0 = Utc::now();

        integral.on_new_sample(&mut bus, t0, Some(0.0));
        assert_eq!(bus.get_latest("volume").unwrap().value.as_f64(), Some(0.0));

        let t1 = t0 + chrono::Duration::seconds(1);
        integral.on_new_sample(&mut bus, t1, Some(10.0));
        assert_eq!(bus.get_latest("volume").unwrap().value.as_f64(), Some(10.0));

        let t2 = t1 + chrono::Duration::seconds(1);
        integral.on_new_sample(&mut bus, t2, Some(10.0));
        assert_eq!(bus.get_latest("volume").unwrap().value.as_f64(), Some(20.0));
    }

    #[test]
    fn time_integral_treats_non_numeric_as_zero() {
        let mut bus = ObservableBus::new("reactor");
        let mut integral = TimeIntegral::new("flow", "volume");
        let t0 = Utc::now();
        integral.on_new_sample(&mut bus, t0, Some(5.0));
        let t1 = t0 + chrono::Duration::seconds(1);
        integral.on_new_sample(&mut bus, t1, None);
        assert_eq!(bus.get_latest("volume").unwrap().value.as_f64(), Some(5.0));
    }

    struct Sum2;
    impl MathExpr for Sum2 {
        fn variables(&self) -> Vec<String> {
            vec!["a".into(), "b".into()]
        }
        fn evaluate(&self, bindings: &HashMap<String, f64>) -> Option<f64> {
            Some(bindings.get("a")? + bindings.get("b")?)
        }
    }

    #[test]
    fn math_expression_skips_when_a_binding_is_missing() {
        let mut bus = ObservableBus::new("lab");
        let mut expr = MathExpression::new("sum", Arc::new(Sum2));
        let t0 = Utc::now();
        bus.update(vec![("a".into(), 1.0.into())], t0);
        expr.on_update(&mut bus, "a", t0);
        assert!(bus.get_latest("sum").is_err(), "b has no samples yet");
    }

    #[test]
    fn math_expression_evaluates_once_all_bindings_present() {
        let mut bus = ObservableBus::new("lab");
        let mut expr = MathExpression::new("sum", Arc::new(Sum2));
        let t0 = Utc::now();
        bus.update(vec![("a".into(), 1.0.into())], t0);
        bus.update(vec![("b".into(), 2.0.into())], t0);
        expr.on_update(&mut bus, "b", t0);
        assert_eq!(bus.get_latest("sum").unwrap().value.as_f64(), Some(3.0));
    }

    #[test]
    fn math_expression_ignores_stale_timestamps() {
        let mut bus = ObservableBus::new("lab");
        let mut expr = MathExpression::new("sum", Arc::new(Sum2));
        let t0 = Utc::now();
        let t1 = t0 + chrono::Duration::seconds(1);
        bus.update(vec![("a".into(), 1.0.into())], t1);
        bus.update(vec![("b".into(), 2.0.into())], t1);
        expr.on_update(&mut bus, "b", t1);
        assert_eq!(bus.get_latest("sum").unwrap().value.as_f64(), Some(3.0));

        // An out-of-order, older timestamp must not re-trigger evaluation.
        expr.on_update(&mut bus, "a", t0);
        assert_eq!(bus.get_latest("sum").unwrap().value.as_f64(), Some(3.0));
    }
}
