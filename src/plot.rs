//! Optional gnuplot script emission (spec.md §6.4), gated by `--plot`.
//!
//! Plots every `<i>.dat` trace file bandwidth.rs already wrote, one line
//! per connection. No teacher or example repo in the corpus emits
//! gnuplot; this is a direct, literal implementation of the spec rather
//! than a pattern borrowed from elsewhere.

use std::io::Write as _;
use std::path::Path;

use crate::error::MultigetError;

pub fn write_script(path: &Path, connection_count: usize) -> Result<(), MultigetError> {
    let mut script = String::new();
    script.push_str("set title 'per-connection transfer progress'\n");
    script.push_str("set xlabel 'ms since start'\n");
    script.push_str("set ylabel 'absolute file position (bytes)'\n");
    script.push_str("plot ");
    for i in 0..connection_count {
        if i > 0 {
            script.push_str(", ");
        }
        script.push_str(&format!("'{i}.dat' using 1:2 with lines title 'connection {i}'"));
    }
    script.push('\n');

    let mut file = std::fs::File::create(path)
        .map_err(|e| MultigetError::Setup(format!("cannot create {}: {e}", path.display())))?;
    file.write_all(script.as_bytes())
        .map_err(MultigetError::Io)?;
    Ok(())
}
