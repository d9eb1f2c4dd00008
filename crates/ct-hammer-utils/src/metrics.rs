// Copyright (c) CT Hammer Developers
// SPDX-License-Identifier: Apache-2.0

//! A prometheus registry that tolerates repeated registration, and macros for metric sets.

use std::{
    any::Any,
    collections::HashMap,
    sync::{Arc, Mutex},
};

use prometheus::core::Collector;

/// Errors returned by [`Registry::get_or_register`].
#[derive(Debug, thiserror::Error)]
pub enum RegistrationError {
    /// The collector was registered before under another type.
    #[error("a collector with the same ID was already registered but with a different type")]
    InconsistentType,

    /// Another collector already registered one of the metric names.
    #[error("at least one metric in the collector has already been registered, ensure no overlaps")]
    MetricsOverlap,

    /// The underlying registry rejected the collector.
    #[error(transparent)]
    Prometheus(prometheus::Error),
}

/// A [`prometheus::Registry`] whose registrations are idempotent.
///
/// Each hammer worker builds its metric handles from the same registry; registering a collector
/// that is already known hands back the registered instance.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    inner: prometheus::Registry,
    collectors: Arc<Mutex<HashMap<u64, Box<dyn Any + Send>>>>,
}

impl Registry {
    /// Returns the registered collector with the same descriptors as `collector`, or registers
    /// `collector` if there is none.
    #[must_use = "the returned collector may differ from the one passed in"]
    pub fn get_or_register<T>(&self, collector: T) -> Result<T, RegistrationError>
    where
        T: Collector + Send + Clone + 'static,
    {
        let id = collector_id(&collector);
        let mut collectors = self
            .collectors
            .lock()
            .expect("registry lock is never poisoned");
        if let Some(known) = collectors.get(&id) {
            return known
                .downcast_ref::<T>()
                .cloned()
                .ok_or(RegistrationError::InconsistentType);
        }

        match self.inner.register(Box::new(collector.clone())) {
            Ok(()) => {
                collectors.insert(id, Box::new(collector.clone()));
                Ok(collector)
            }
            Err(prometheus::Error::AlreadyReg) => Err(RegistrationError::MetricsOverlap),
            Err(other) => Err(RegistrationError::Prometheus(other)),
        }
    }

    /// Encodes all metrics in the prometheus text exposition format.
    pub fn encode_text(&self) -> Result<String, prometheus::Error> {
        prometheus::TextEncoder::new().encode_to_string(&self.inner.gather())
    }
}

/// Identifies a collector by its descriptors, like [`prometheus::Registry::register`] does.
fn collector_id<T: Collector>(collector: &T) -> u64 {
    collector
        .desc()
        .into_iter()
        .fold(0, |id, desc| id.wrapping_add(desc.id))
}

/// Defines a struct of prometheus metrics registered under one namespace.
///
/// Each field names its metric type followed by its label names in brackets; scalar metrics
/// use empty brackets.
///
/// ```ignore
/// ct_hammer_utils::define_metric_set! {
///     #[namespace = "ct_hammer"]
///     /// Metrics of a worker.
///     pub struct WorkerMetrics {
///         #[help = "Requests by log"]
///         requests_total: IntCounterVec["log"],
///         #[help = "Running workers"]
///         active_workers: IntGauge[],
///     }
/// }
/// ```
#[macro_export]
macro_rules! define_metric_set {
    (
        #[namespace = $namespace:literal]
        $(#[$outer:meta])*
        $vis:vis struct $name:ident {
            $(
                #[help = $help:literal]
                $field:ident: $metric:ident $labels:tt
            ),* $(,)?
        }
    ) => {
        $(#[$outer])*
        #[derive(Debug, Clone)]
        $vis struct $name {
            $(
                #[doc = $help]
                pub $field: $metric,
            )*
        }

        impl $name {
            /// Namespace of the metrics in this set.
            pub const NAMESPACE: &'static str = $namespace;

            /// Registers the metrics on `registry`, or reuses those registered earlier.
            ///
            /// # Panics
            ///
            /// Panics if another collector already uses one of the metric names.
            pub fn new(registry: &$crate::metrics::Registry) -> Self {
                Self { $(
                    $field: {
                        let opts = ::prometheus::Opts::new(stringify!($field), $help)
                            .namespace($namespace);
                        let metric = $crate::define_metric_set!(@metric $metric, opts, $labels);
                        registry
                            .get_or_register(metric)
                            .expect("metrics defined at compile time must be valid")
                    },
                )* }
            }
        }
    };
    (@metric $metric:ty, $opts:expr, []) => {
        <$metric>::with_opts($opts.into()).expect("metric options are valid")
    };
    (@metric $metric:ty, $opts:expr, $labels:expr) => {
        <$metric>::new($opts.into(), &$labels).expect("metric options are valid")
    };
}

/// Selects the child of a vec-metric with the given label values.
#[macro_export]
macro_rules! with_label {
    ($metric:expr, $($label:expr),+ $(,)?) => {
        $metric.with_label_values(&[$($label.as_ref()),+])
    };
}

#[cfg(test)]
mod tests {
    use prometheus::{Counter, Gauge, IntCounterVec, IntGauge};

    use super::*;

    define_metric_set! {
        #[namespace = "test"]
        /// Metrics used in the tests below.
        struct TestMetrics {
            #[help = "A counter with labels"]
            labelled_total: IntCounterVec["kind"],
            #[help = "A gauge"]
            in_flight: IntGauge[],
        }
    }

    #[test]
    fn repeated_registration_returns_the_known_collector() {
        let registry = Registry::default();
        let first = registry
            .get_or_register(Counter::new("rounds", "rounds run").unwrap())
            .unwrap();
        let second = registry
            .get_or_register(Counter::new("rounds", "rounds run").unwrap())
            .unwrap();

        first.inc();
        assert_eq!(second.get(), 1.0);
    }

    #[test]
    fn same_name_with_another_type_is_rejected() {
        let registry = Registry::default();
        let _ = registry
            .get_or_register(Counter::new("rounds", "rounds run").unwrap())
            .unwrap();

        let error = registry
            .get_or_register(Gauge::new("rounds", "rounds run").unwrap())
            .expect_err("the name is taken by a counter");
        assert!(matches!(error, RegistrationError::InconsistentType));
    }

    #[test]
    fn metric_sets_share_collectors() {
        let registry = Registry::default();
        let first = TestMetrics::new(&registry);
        let second = TestMetrics::new(&registry);

        with_label!(first.labelled_total, "get-sth").inc();
        with_label!(second.labelled_total, "get-sth").inc();
        assert_eq!(with_label!(first.labelled_total, "get-sth").get(), 2);
        first.in_flight.inc();
        assert_eq!(second.in_flight.get(), 1);

        let text = registry.encode_text().unwrap();
        assert!(text.contains("test_labelled_total{kind=\"get-sth\"} 2"));
    }
}
