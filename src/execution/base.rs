//! Operator base: channels, phase timing, cancellation, and the shared
//! consumer driver.
//!
//! Every operator is one task. It reads annotated values from a bounded
//! input channel, writes to a bounded output channel, and observes a
//! watch-based stop signal. `SendStop` is a watch write: idempotent and
//! non-blocking. Closing the output (dropping the sender) is the EOF the
//! downstream operator sees.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch, Mutex};

use crate::value::AnnotatedValue;

use super::context::{Context, PhaseId};

pub type ValueSender = mpsc::Sender<AnnotatedValue>;
pub type ValueReceiver = mpsc::Receiver<AnnotatedValue>;

/// Scans flush their phase document count at this granularity.
pub const PHASE_UPDATE_COUNT: u64 = 1024;

/// Wall-time attribution of an operator's current activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// On-CPU work.
    Exec,
    /// Waiting on a datastore or index call.
    Serv,
    /// Waiting on a channel.
    Chan,
    /// Idle; nothing is accrued.
    Idle,
}

/// Accrues wall time into exec/serv/chan buckets and flushes the busy
/// time to the context under the operator's phase id.
pub struct PhaseTimer {
    kernel: Option<PhaseId>,
    current: Phase,
    since: Instant,
    exec: Duration,
    serv: Duration,
    chan: Duration,
}

impl PhaseTimer {
    pub fn new(kernel: Option<PhaseId>) -> Self {
        Self {
            kernel,
            current: Phase::Idle,
            since: Instant::now(),
            exec: Duration::ZERO,
            serv: Duration::ZERO,
            chan: Duration::ZERO,
        }
    }

    pub fn switch(&mut self, next: Phase) {
        if self.current == next {
            return;
        }
        let elapsed = self.since.elapsed();
        match self.current {
            Phase::Exec => self.exec += elapsed,
            Phase::Serv => self.serv += elapsed,
            Phase::Chan => self.chan += elapsed,
            Phase::Idle => {}
        }
        self.current = next;
        self.since = Instant::now();
    }

    pub fn exec_time(&self) -> Duration {
        self.exec
    }

    /// Accrues the open phase and reports busy time to the context.
    pub fn finish(&mut self, ctx: &Context) {
        self.switch(Phase::Idle);
        if let Some(kernel) = self.kernel {
            ctx.add_phase_time(kernel, self.exec + self.serv);
        }
    }
}

/// Waits until the stop flag is raised. A dropped stop sender counts as
/// a stop.
pub async fn stop_wait(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|s| *s).await;
}

/// An operator's input: an exclusive channel, or a shared channel that
/// parallel replicas steal from.
pub enum ValueInput {
    Chan(ValueReceiver),
    Shared(Arc<Mutex<ValueReceiver>>),
}

impl ValueInput {
    pub async fn recv(&mut self) -> Option<AnnotatedValue> {
        match self {
            ValueInput::Chan(rx) => rx.recv().await,
            ValueInput::Shared(shared) => {
                let mut guard = shared.lock().await;
                guard.recv().await
            }
        }
    }

    /// Converts into a shareable receiver for parallel fan-out.
    pub fn into_shared(self) -> Arc<Mutex<ValueReceiver>> {
        match self {
            ValueInput::Chan(rx) => Arc::new(Mutex::new(rx)),
            ValueInput::Shared(shared) => shared,
        }
    }
}

/// Per-operator runtime handles: output, stop, timer, replica bit and the
/// request context.
pub struct OperatorIo {
    pub ctx: Arc<Context>,
    pub timer: PhaseTimer,
    output: Option<ValueSender>,
    stop: watch::Receiver<bool>,
    bit: u8,
}

impl OperatorIo {
    pub fn new(
        ctx: Arc<Context>,
        output: Option<ValueSender>,
        stop: watch::Receiver<bool>,
        kernel: Option<PhaseId>,
        bit: u8,
    ) -> Self {
        Self {
            ctx,
            timer: PhaseTimer::new(kernel),
            output,
            stop,
            bit,
        }
    }

    /// Sends one item downstream, stamping the replica bit. Returns
    /// false when stopped or when the consumer is gone.
    pub async fn send_item(&mut self, mut item: AnnotatedValue) -> bool {
        let Some(output) = &self.output else {
            return false;
        };
        item.set_bit(self.bit);
        self.timer.switch(Phase::Chan);
        let ok = tokio::select! {
            res = output.send(item) => res.is_ok(),
            _ = stop_wait(&mut self.stop) => false,
        };
        self.timer.switch(Phase::Exec);
        ok
    }

    pub fn stopped(&self) -> bool {
        *self.stop.borrow()
    }

    /// A second stop handle, for operators that run their own select
    /// loops (scans, joins).
    pub fn stop_handle(&self) -> watch::Receiver<bool> {
        self.stop.clone()
    }

    /// Closes the output early (EOF to the consumer).
    pub fn close_output(&mut self) {
        self.output = None;
    }
}

/// The operator protocol. `before_items` runs once (producers do all
/// their work here); `process_item` runs per input item and returns
/// false to end the stream; `after_items` drains buffered state.
#[async_trait]
pub trait Operator: Send + 'static {
    fn name(&self) -> &'static str;

    async fn before_items(
        &mut self,
        _io: &mut OperatorIo,
        _parent: Option<&AnnotatedValue>,
    ) -> bool {
        true
    }

    async fn process_item(&mut self, item: AnnotatedValue, io: &mut OperatorIo) -> bool;

    async fn after_items(&mut self, _io: &mut OperatorIo) {}
}

/// Drives one operator to completion: setup, item loop, drain, close.
pub async fn run_operator<O: Operator>(
    mut op: O,
    mut io: OperatorIo,
    input: Option<ValueInput>,
    parent: Option<AnnotatedValue>,
) {
    io.timer.switch(Phase::Exec);
    let mut stop = io.stop_handle();
    if op.before_items(&mut io, parent.as_ref()).await {
        if let Some(mut input) = input {
            loop {
                io.timer.switch(Phase::Chan);
                let next = tokio::select! {
                    biased;
                    _ = stop_wait(&mut stop) => None,
                    item = input.recv() => item,
                };
                io.timer.switch(Phase::Exec);
                let Some(item) = next else {
                    break;
                };
                if !op.process_item(item, &mut io).await {
                    break;
                }
            }
        }
        op.after_items(&mut io).await;
    }
    let ctx = io.ctx.clone();
    io.timer.finish(&ctx);
    // dropping io closes the output channel
}

/// Shareable cancellation handle over a pipeline's operator stops.
#[derive(Clone)]
pub struct PipelineStopper {
    stops: Arc<Vec<watch::Sender<bool>>>,
}

impl PipelineStopper {
    pub fn new(stops: Vec<watch::Sender<bool>>) -> Self {
        Self {
            stops: Arc::new(stops),
        }
    }

    /// Cooperative cancellation: idempotent and non-blocking.
    pub fn send_stop(&self) {
        for stop in self.stops.iter() {
            let _ = stop.send(true);
        }
    }
}

/// Handles to a spawned pipeline: the terminal output channel, the stop
/// fan-out, and the task handles.
pub struct Pipeline {
    pub output: Option<ValueReceiver>,
    pub stopper: PipelineStopper,
    pub handles: Vec<tokio::task::JoinHandle<()>>,
}

impl Pipeline {
    /// Cooperative cancellation: idempotent and non-blocking.
    pub fn send_stop(&self) {
        self.stopper.send_stop();
    }

    /// A cloneable stop handle for watchers.
    pub fn stopper(&self) -> PipelineStopper {
        self.stopper.clone()
    }

    /// Awaits every operator task.
    pub async fn join(&mut self) {
        for handle in self.handles.drain(..) {
            let _ = handle.await;
        }
    }

    pub fn take_output(&mut self) -> Option<ValueReceiver> {
        self.output.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::MemoryDatastore;
    use crate::execution::context::CollectorSink;
    use crate::server::settings::Settings;
    use crate::value::Value;

    fn test_ctx() -> Arc<Context> {
        let store = MemoryDatastore::new("t");
        let (sink, _rows) = CollectorSink::new();
        Context::new("req", store, Settings::default(), Box::new(sink))
    }

    struct Passthrough;

    #[async_trait]
    impl Operator for Passthrough {
        fn name(&self) -> &'static str {
            "passthrough"
        }

        async fn process_item(&mut self, item: AnnotatedValue, io: &mut OperatorIo) -> bool {
            io.send_item(item).await
        }
    }

    #[tokio::test]
    async fn test_operator_forwards_and_closes() {
        let ctx = test_ctx();
        let (in_tx, in_rx) = mpsc::channel(4);
        let (out_tx, mut out_rx) = mpsc::channel(4);
        let (_stop_tx, stop_rx) = watch::channel(false);
        let io = OperatorIo::new(ctx, Some(out_tx), stop_rx, None, 0);

        let task = tokio::spawn(run_operator(
            Passthrough,
            io,
            Some(ValueInput::Chan(in_rx)),
            None,
        ));

        in_tx
            .send(AnnotatedValue::new(Value::int(1)))
            .await
            .unwrap();
        drop(in_tx);

        let got = out_rx.recv().await.unwrap();
        assert_eq!(got.value(), &Value::int(1));
        // upstream EOF propagates: output closes
        assert!(out_rx.recv().await.is_none());
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_closes_output_without_forwarding() {
        let ctx = test_ctx();
        let (in_tx, in_rx) = mpsc::channel(4);
        let (out_tx, mut out_rx) = mpsc::channel(4);
        let (stop_tx, stop_rx) = watch::channel(false);
        let io = OperatorIo::new(ctx, Some(out_tx), stop_rx, None, 0);

        let task = tokio::spawn(run_operator(
            Passthrough,
            io,
            Some(ValueInput::Chan(in_rx)),
            None,
        ));

        stop_tx.send(true).unwrap();
        // the operator should exit even though input stays open
        tokio::time::timeout(Duration::from_secs(1), async {
            assert!(out_rx.recv().await.is_none());
        })
        .await
        .expect("operator did not close after stop");
        task.await.unwrap();
        drop(in_tx);
    }

    #[tokio::test]
    async fn test_shared_input_distributes_items() {
        let (tx, rx) = mpsc::channel(8);
        let shared = ValueInput::Chan(rx).into_shared();
        for i in 0..4 {
            tx.send(AnnotatedValue::new(Value::int(i))).await.unwrap();
        }
        drop(tx);

        let mut a = ValueInput::Shared(shared.clone());
        let mut b = ValueInput::Shared(shared);
        let mut count = 0;
        while a.recv().await.is_some() {
            count += 1;
            if b.recv().await.is_some() {
                count += 1;
            }
        }
        assert_eq!(count, 4);
    }
}
