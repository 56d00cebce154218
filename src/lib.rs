/*! Passive TCP delivery-rate analysis.

`tcplens` replays captured IPv4/TCP traces and reconstructs, for every
observed connection, what limited the sender's throughput round trip by
round trip: slow start, the bottleneck bandwidth, the application, the
kernel's send buffer or congestion control, the receiver's window, path
congestion, or a bloated queue.

The crate is a library plus thin capture-loop binaries. The [wire]
module parses frames, [unit] normalizes them, [flow] rebuilds each
connection's in-flight state and rate samples, and [analyzer] votes the
samples into per-round-trip verdicts. Everything is synchronous and
driven purely by capture timestamps, so offline runs are deterministic.
*/

pub mod analyzer;
pub mod flow;
pub mod phy;
pub mod time;
pub mod unit;
pub mod wire;
