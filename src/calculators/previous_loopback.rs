//! PreviousLoopbackCalculator — pairs each MAIN packet with the LOOP packet
//! produced for the previous MAIN timestamp.
//!
//! ```text
//! MAIN ──►┌──────────────────┐
//!         │ PreviousLoopback ├──► PREV_LOOP ──► ... ──┐
//! LOOP ──►└──────────────────┘                        │
//!   ▲                                                 │
//!   └──────────────── back edge ◄─────────────────────┘
//! ```
//!
//! For MAIN at t, PREV_LOOP carries the LOOP value stamped with the MAIN
//! timestamp before t, re-stamped to t. The first MAIN packet only advances
//! the PREV_LOOP bound, as does a previous timestamp for which LOOP settled
//! without a packet.

use crate::config::InputStreamHandlerConfig;
use crate::error::{GraphError, Result};
use crate::framework::calculator::Calculator;
use crate::framework::context::CalculatorContext;
use crate::framework::contract::CalculatorContract;
use crate::framework::packet::Packet;
use crate::framework::port::PacketType;
use crate::framework::timestamp::Timestamp;
use std::collections::VecDeque;

/// A MAIN timestamp waiting for its loop value.
#[derive(Debug, Clone, Copy)]
struct PendingMain {
    timestamp: Timestamp,
    previous: Option<Timestamp>,
}

#[derive(Debug)]
pub struct PreviousLoopbackCalculator {
    pending: VecDeque<PendingMain>,
    loop_packets: VecDeque<Packet>,
    /// Latest settled timestamp of LOOP
    loop_settled: Timestamp,
    /// Latest settled timestamp of MAIN
    main_settled: Timestamp,
    previous_main: Option<Timestamp>,
}

impl Default for PreviousLoopbackCalculator {
    fn default() -> Self {
        Self {
            pending: VecDeque::new(),
            loop_packets: VecDeque::new(),
            loop_settled: Timestamp::UNSET,
            main_settled: Timestamp::UNSET,
            previous_main: None,
        }
    }
}

impl PreviousLoopbackCalculator {
    /// Emit or skip every pending MAIN timestamp whose loop value is known.
    fn resolve(&mut self, ctx: &mut CalculatorContext) -> Result<()> {
        while let Some(main) = self.pending.front().copied() {
            let Some(previous) = main.previous else {
                ctx.outputs()
                    .tag("PREV_LOOP")?
                    .set_next_timestamp_bound(main.timestamp.next_allowed_in_stream()?);
                self.pending.pop_front();
                continue;
            };

            while self
                .loop_packets
                .front()
                .is_some_and(|p| p.timestamp() < previous)
            {
                self.loop_packets.pop_front();
            }

            match self.loop_packets.front() {
                Some(packet) if packet.timestamp() == previous => {
                    let packet = packet.at(main.timestamp);
                    ctx.outputs().tag("PREV_LOOP")?.add(packet)?;
                    self.loop_packets.pop_front();
                }
                _ if self.loop_settled >= previous => {
                    ctx.outputs()
                        .tag("PREV_LOOP")?
                        .set_next_timestamp_bound(main.timestamp.next_allowed_in_stream()?);
                }
                _ => break,
            }
            self.pending.pop_front();
        }

        if self.pending.is_empty() && self.main_settled.is_range_value() {
            ctx.outputs()
                .tag("PREV_LOOP")?
                .set_next_timestamp_bound(self.main_settled.next_allowed_in_stream()?);
        }
        Ok(())
    }
}

impl Calculator for PreviousLoopbackCalculator {
    fn contract(cc: &mut CalculatorContract) -> Result<()> {
        cc.inputs().expect_tags(&["MAIN", "LOOP"])?;
        cc.outputs().expect_tags(&["PREV_LOOP"])?;
        let (Some(main), true, true) = (
            cc.inputs().id("MAIN", 0),
            cc.inputs().has_tag("LOOP"),
            cc.outputs().has_tag("PREV_LOOP"),
        ) else {
            return Err(GraphError::InvalidConfig(format!(
                "node '{}' needs MAIN and LOOP inputs and a PREV_LOOP output",
                cc.node_name()
            )));
        };
        cc.inputs_mut().set_tag("MAIN", PacketType::Any)?;
        cc.inputs_mut().set_tag("LOOP", PacketType::Any)?;
        cc.outputs_mut()
            .set_tag("PREV_LOOP", PacketType::same_as_input(main))?;
        cc.set_input_stream_handler(InputStreamHandlerConfig::Immediate);
        cc.set_process_timestamp_bounds(true);
        Ok(())
    }

    fn process(&mut self, ctx: &mut CalculatorContext) -> Result<()> {
        let main = ctx.inputs().tag("MAIN")?.clone();
        let looped = ctx.inputs().tag("LOOP")?.clone();

        if main.timestamp().is_range_value() {
            self.main_settled = self.main_settled.max(main.timestamp());
        }
        if !main.is_empty() {
            self.pending.push_back(PendingMain {
                timestamp: main.timestamp(),
                previous: self.previous_main,
            });
            self.previous_main = Some(main.timestamp());
        }

        self.loop_settled = self.loop_settled.max(looped.timestamp());
        if !looped.is_empty() {
            self.loop_packets.push_back(looped.packet().clone());
        }

        self.resolve(ctx)
    }
}
