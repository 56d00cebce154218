/*! Flow lookup and lifecycle.

The registry maps each direction-insensitive 4-tuple to a live
[TcpFlow], creates flows when traffic first shows up, routes each unit
to the data or ack entry point of its flow, and tears flows down on the
connection-ending segments. A torn-down flow's observer is handed back
to the caller so it can flush whatever the observer accumulated.

[TcpFlow]: ../struct.TcpFlow.html
*/

use std::collections::HashMap;

use crate::flow::{FlowObserver, TcpFlow};
use crate::unit::Unit;
use crate::wire::Ipv4Address;

/// The direction-insensitive connection 4-tuple. Two units with swapped
/// endpoints map to the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    lo: (Ipv4Address, u16),
    hi: (Ipv4Address, u16),
}

impl FlowKey {
    pub fn of(u: &Unit) -> FlowKey {
        let a = (u.src_addr, u.src_port);
        let b = (u.dst_addr, u.dst_port);
        if a <= b {
            FlowKey { lo: a, hi: b }
        } else {
            FlowKey { lo: b, hi: a }
        }
    }
}

/// Which role a unit plays for its flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Data,
    Ack,
}

/// Decides which captured units belong to the observed sender.
///
/// The sender address alone is enough on a two-host trace; pinning the
/// receiver too keeps a busy capture from pulling in unrelated flows.
#[derive(Debug, Clone, Copy)]
pub struct SenderSelector {
    src: Ipv4Address,
    dst: Option<Ipv4Address>,
}

impl SenderSelector {
    pub fn new(src: Ipv4Address, dst: Option<Ipv4Address>) -> SenderSelector {
        SenderSelector { src, dst }
    }

    fn classify(&self, u: &Unit) -> Option<Direction> {
        if u.src_addr == self.src && self.dst.map_or(true, |d| u.dst_addr == d) {
            Some(Direction::Data)
        } else if u.dst_addr == self.src && self.dst.map_or(true, |d| u.src_addr == d) {
            Some(Direction::Ack)
        } else {
            None
        }
    }
}

/// All live flows of one capture.
pub struct FlowMap<O, F> {
    selector: SenderSelector,
    make_observer: F,
    flows: HashMap<FlowKey, TcpFlow<O>>,
}

impl<O, F> FlowMap<O, F>
where
    O: FlowObserver,
    F: FnMut(u16) -> O,
{
    /// `make_observer` builds the observer for a freshly created flow,
    /// given the receiver port.
    pub fn new(selector: SenderSelector, make_observer: F) -> FlowMap<O, F> {
        FlowMap {
            selector,
            make_observer,
            flows: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    /// Route one unit. Returns the observer of a flow this unit tore
    /// down, if any.
    ///
    /// Creation: a sender SYN or sender payload opens a flow, as does a
    /// receiver SYN. Teardown: a bare FIN or a RST from the sender, or a
    /// RST from the receiver. A receiver FIN does *not* tear down - the
    /// sender may still be transmitting.
    pub fn dispatch(&mut self, u: &Unit) -> Option<O> {
        let direction = self.selector.classify(u)?;
        let key = FlowKey::of(u);

        match direction {
            Direction::Data => {
                if let Some(flow) = self.flows.get_mut(&key) {
                    if u.data_length > 0 || u.is_syn() {
                        flow.on_data_unit(u);
                        None
                    } else if u.is_fin() || u.is_rst() {
                        self.flows.remove(&key).map(TcpFlow::into_observer)
                    } else {
                        None
                    }
                } else if u.is_fin() || u.is_rst() {
                    None
                } else if u.is_syn() || u.data_length > 0 {
                    let observer = (self.make_observer)(u.dst_port);
                    let mut flow = TcpFlow::from_data_unit(u, observer);
                    flow.on_data_unit(u);
                    self.flows.insert(key, flow);
                    None
                } else {
                    None
                }
            }
            Direction::Ack => {
                if let Some(flow) = self.flows.get_mut(&key) {
                    if !u.is_rst() {
                        // a receiver FIN still goes in: the sender can
                        // keep sending past it
                        flow.on_ack_unit(u);
                        None
                    } else {
                        self.flows.remove(&key).map(TcpFlow::into_observer)
                    }
                } else if u.is_syn() {
                    let observer = (self.make_observer)(u.src_port);
                    let mut flow = TcpFlow::from_ack_unit(u, observer);
                    flow.on_ack_unit(u);
                    self.flows.insert(key, flow);
                    None
                } else {
                    None
                }
            }
        }
    }

    /// Tear down every remaining flow, yielding the observers; called at
    /// end-of-trace so each one can be flushed.
    pub fn close_all(&mut self) -> Vec<O> {
        self.flows
            .drain()
            .map(|(_, flow)| flow.into_observer())
            .collect()
    }
}
