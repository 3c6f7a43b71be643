/*
Copyright 2025 Google LLC

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

     https://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

//! `buildmk::timeutil` reports the wall-clock duration of the major phases
//! of a run (parse, eval, dep, ninja generation, ...) to the log, the way
//! [`crate::stats`] reports finer-grained counters.

use std::time::Instant;

/// Times the scope it's held for and logs the elapsed duration on drop.
///
/// Construct one at the top of a phase and let it go out of scope at the
/// end:
///
/// ```ignore
/// let _tr = ScopedTimeReporter::new("eval time");
/// ```
pub struct ScopedTimeReporter {
    name: &'static str,
    start: Instant,
}

impl ScopedTimeReporter {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            start: Instant::now(),
        }
    }
}

impl Drop for ScopedTimeReporter {
    fn drop(&mut self) {
        log::debug!("{}: {:.3}s", self.name, self.start.elapsed().as_secs_f64());
    }
}
