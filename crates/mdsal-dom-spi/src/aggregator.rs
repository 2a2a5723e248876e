//! Coalescing of state reported by several concurrent sources.
//!
//! Each source owns a [`StateBuilder`]. While the aggregator is starting,
//! reported state is appended silently. [`StateAggregator::start`] switches it
//! once to a [`Started`] behavior. An operational aggregator delivers the
//! built state of every source to a [`StateSink`], with at most one thread
//! running the delivery loop at any time. A failed aggregator ignores
//! everything.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::error::{DomError, DomResult};

/// Per-source accumulator of state.
pub trait StateBuilder: Send + 'static {
    /// State unit reported by a source and delivered downstream.
    type State: Send;

    /// Append state reported while the aggregator is operational.
    fn append(&mut self, state: Self::State);

    /// Append state reported while the aggregator is still starting.
    fn append_initial(&mut self, state: Self::State);

    /// Produce the state accumulated so far, resetting the accumulator.
    fn build(&mut self) -> Self::State;
}

/// Handle to one source's builder.
pub struct BuilderRef<B>(Arc<Mutex<B>>);

impl<B> Clone for BuilderRef<B> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<B: StateBuilder> BuilderRef<B> {
    fn new(builder: B) -> Self {
        Self(Arc::new(Mutex::new(builder)))
    }

    fn build(&self) -> B::State {
        self.0.lock().build()
    }
}

/// Downstream consumer of aggregated state.
pub trait StateSink<S>: Send + Sync {
    /// Receive one state per source, in source registration order.
    fn notify_listener(&self, states: Vec<S>);
}

/// Operational behavior: delivers state with single-flight notification.
pub struct Operational<B: StateBuilder> {
    builders: Vec<BuilderRef<B>>,
    sink: Box<dyn StateSink<B::State>>,
    notifying: AtomicBool,
    generation: AtomicU64,
    processed: AtomicU64,
}

impl<B: StateBuilder> Operational<B> {
    /// Create the behavior over the aggregator's builders.
    pub fn new(builders: Vec<BuilderRef<B>>, sink: Box<dyn StateSink<B::State>>) -> Self {
        Self {
            builders,
            sink,
            notifying: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            processed: AtomicU64::new(0),
        }
    }

    /// Deliver the current state of every builder.
    pub fn notify_listener(&self) {
        let states = self.builders.iter().map(BuilderRef::build).collect();
        self.sink.notify_listener(states);
    }

    fn receive_state(&self, builder: &BuilderRef<B>, state: B::State) {
        let generation = {
            let mut guard = builder.0.lock();
            // Bumped together with the append so a notifier which sees the new
            // generation also sees the state.
            let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
            guard.append(state);
            generation
        };
        self.try_notify_listener(generation);
    }

    fn try_notify_listener(&self, initial: u64) {
        let mut generation = initial;
        while generation != self.processed.load(Ordering::SeqCst)
            && self
                .notifying
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            self.processed.store(generation, Ordering::SeqCst);
            self.notify_listener();
            self.notifying.store(false, Ordering::SeqCst);

            let next = self.generation.load(Ordering::SeqCst);
            if next == generation {
                return;
            }
            trace!("Generation moved from {} to {} while notifying", generation, next);
            generation = next;
        }
    }
}

/// Behavior after [`StateAggregator::start`].
pub enum Started<B: StateBuilder> {
    /// State is delivered downstream.
    Operational(Operational<B>),
    /// State is dropped.
    Failed,
}

impl<B: StateBuilder> Started<B> {
    fn receive_state(&self, builder: &BuilderRef<B>, state: B::State) {
        match self {
            Started::Operational(operational) => operational.receive_state(builder, state),
            Started::Failed => trace!("Ignoring state reported to a failed aggregator"),
        }
    }
}

/// Aggregates state from several sources for one downstream consumer.
pub struct StateAggregator<B: StateBuilder> {
    builders: Mutex<Vec<BuilderRef<B>>>,
    starting: Mutex<()>,
    started: OnceLock<Started<B>>,
}

impl<B: StateBuilder> StateAggregator<B> {
    /// Create an aggregator in the starting phase.
    pub fn new(size_hint: usize) -> Self {
        Self {
            builders: Mutex::new(Vec::with_capacity(size_hint)),
            starting: Mutex::new(()),
            started: OnceLock::new(),
        }
    }

    /// Add a source. Only possible before the aggregator is started.
    pub fn add_builder(&self, builder: B) -> DomResult<BuilderRef<B>> {
        let _starting = self.starting.lock();
        if self.started.get().is_some() {
            return Err(DomError::IllegalState(
                "cannot add a source to a started aggregator".to_string(),
            ));
        }
        let builder = BuilderRef::new(builder);
        self.builders.lock().push(builder.clone());
        Ok(builder)
    }

    /// Whether [`Self::start`] has run.
    pub fn is_started(&self) -> bool {
        self.started.get().is_some()
    }

    /// Report state from the source owning `builder`.
    pub fn receive_state(&self, builder: &BuilderRef<B>, state: B::State) {
        if let Some(started) = self.started.get() {
            started.receive_state(builder, state);
            return;
        }

        let starting = self.starting.lock();
        if let Some(started) = self.started.get() {
            drop(starting);
            started.receive_state(builder, state);
            return;
        }
        builder.0.lock().append_initial(state);
    }

    /// Leave the starting phase. `build` receives every builder and returns
    /// the behavior to switch to. Starting twice fails.
    pub fn start<F>(&self, build: F) -> DomResult<&Started<B>>
    where
        F: FnOnce(Vec<BuilderRef<B>>) -> Started<B>,
    {
        let _starting = self.starting.lock();
        if self.started.get().is_some() {
            return Err(DomError::IllegalState(
                "attempted to start an already-started aggregator".to_string(),
            ));
        }
        let builders = self.builders.lock().clone();
        debug!("Starting aggregator with {} sources", builders.len());
        let behavior = build(builders);
        Ok(self.started.get_or_init(|| behavior))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    /// Keeps every appended value; `build` returns and clears them.
    #[derive(Default)]
    struct VecBuilder {
        values: Vec<u64>,
    }

    impl StateBuilder for VecBuilder {
        type State = Vec<u64>;

        fn append(&mut self, state: Vec<u64>) {
            self.values.extend(state);
        }

        fn append_initial(&mut self, state: Vec<u64>) {
            // Only the most recent value matters before start.
            self.values.clear();
            self.values.extend(state.last().copied());
        }

        fn build(&mut self) -> Vec<u64> {
            std::mem::take(&mut self.values)
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        deliveries: Mutex<Vec<Vec<Vec<u64>>>>,
    }

    impl StateSink<Vec<u64>> for Arc<RecordingSink> {
        fn notify_listener(&self, states: Vec<Vec<u64>>) {
            self.deliveries.lock().push(states);
        }
    }

    fn operational(sink: &Arc<RecordingSink>) -> impl FnOnce(Vec<BuilderRef<VecBuilder>>) -> Started<VecBuilder> {
        let sink = Arc::clone(sink);
        move |builders| {
            let operational = Operational::new(builders, Box::new(sink));
            operational.notify_listener();
            Started::Operational(operational)
        }
    }

    #[test]
    fn test_starting_squashes_and_start_delivers_once() {
        let aggregator = StateAggregator::new(2);
        let a = aggregator.add_builder(VecBuilder::default()).unwrap();
        let b = aggregator.add_builder(VecBuilder::default()).unwrap();
        aggregator.receive_state(&a, vec![1, 2]);
        aggregator.receive_state(&a, vec![3]);
        aggregator.receive_state(&b, vec![7]);

        let sink = Arc::new(RecordingSink::default());
        aggregator.start(operational(&sink)).unwrap();
        assert!(aggregator.is_started());
        assert_eq!(*sink.deliveries.lock(), vec![vec![vec![3], vec![7]]]);
    }

    #[test]
    fn test_operational_delivers_each_report() {
        let aggregator = StateAggregator::new(1);
        let a = aggregator.add_builder(VecBuilder::default()).unwrap();
        let sink = Arc::new(RecordingSink::default());
        aggregator.start(operational(&sink)).unwrap();

        aggregator.receive_state(&a, vec![1]);
        aggregator.receive_state(&a, vec![2]);
        let deliveries = sink.deliveries.lock();
        assert_eq!(deliveries.len(), 3);
        assert_eq!(deliveries[1], vec![vec![1]]);
        assert_eq!(deliveries[2], vec![vec![2]]);
    }

    #[test]
    fn test_start_twice_and_late_builder_fail() {
        let aggregator = StateAggregator::<VecBuilder>::new(0);
        aggregator.start(|_| Started::Failed).unwrap();
        assert!(aggregator.start(|_| Started::Failed).is_err());
        assert!(aggregator.add_builder(VecBuilder::default()).is_err());
    }

    #[test]
    fn test_failed_ignores_state() {
        let aggregator = StateAggregator::new(1);
        let a = aggregator.add_builder(VecBuilder::default()).unwrap();
        aggregator.start(|_| Started::Failed).unwrap();
        aggregator.receive_state(&a, vec![1]);
        assert!(a.build().is_empty());
    }

    #[test]
    fn test_concurrent_reporters_lose_nothing() {
        let aggregator = Arc::new(StateAggregator::new(4));
        let builders: Vec<_> = (0..4)
            .map(|_| aggregator.add_builder(VecBuilder::default()).unwrap())
            .collect();
        let sink = Arc::new(RecordingSink::default());
        aggregator.start(operational(&sink)).unwrap();

        let handles: Vec<_> = builders
            .into_iter()
            .enumerate()
            .map(|(index, builder)| {
                let aggregator = Arc::clone(&aggregator);
                thread::spawn(move || {
                    for i in 0..200u64 {
                        aggregator.receive_state(&builder, vec![index as u64 * 1000 + i]);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let deliveries = sink.deliveries.lock();
        // The initial delivery plus at most one per generation.
        assert!(deliveries.len() <= 801);
        for source in 0..4usize {
            let received: Vec<u64> = deliveries
                .iter()
                .flat_map(|states| states[source].iter().copied())
                .collect();
            let expected: Vec<u64> = (0..200).map(|i| source as u64 * 1000 + i).collect();
            assert_eq!(received, expected);
        }
    }
}
