// SPDX-License-Identifier: Apache-2.0

pub mod otlp;

use opentelemetry::global;
use opentelemetry::metrics::Meter;

// Counters go to whichever MeterProvider the embedding process installed.
pub fn get_meter() -> Meter {
    global::meter("receivers")
}
