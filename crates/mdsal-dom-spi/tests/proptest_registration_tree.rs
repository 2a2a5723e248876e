//! Property-based tests for listener registration and state aggregation.

use mdsal_dom_spi::{
    BuilderRef, DataTreeCandidatePublisher, InstanceIdentifier, Operational, PathArgument, StateAggregator,
    StateBuilder, StateSink, Started,
};
use parking_lot::Mutex;
use proptest::prelude::*;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Paths over a small alphabet so registrations share ancestors.
fn any_path() -> impl Strategy<Value = InstanceIdentifier> {
    proptest::collection::vec(prop_oneof![Just("a"), Just("b"), Just("c")], 0..4)
        .prop_map(|names| names.into_iter().map(PathArgument::node).collect::<InstanceIdentifier>())
}

/// Registrations as (path, id), plus the order to remove them in.
fn registrations() -> impl Strategy<Value = (Vec<(InstanceIdentifier, u32)>, Vec<usize>)> {
    proptest::collection::vec(any_path(), 1..24).prop_flat_map(|paths| {
        let registrations: Vec<_> = paths.into_iter().zip(0u32..).collect();
        let order: Vec<usize> = (0..registrations.len()).collect();
        (Just(registrations), Just(order).prop_shuffle())
    })
}

/// Nodes a tree holding registrations at `paths` needs: the root plus every
/// non-empty prefix.
fn expected_nodes<'a>(paths: impl Iterator<Item = &'a InstanceIdentifier>) -> usize {
    let mut prefixes = BTreeSet::new();
    for path in paths {
        let arguments = path.path_arguments();
        for len in 1..=arguments.len() {
            prefixes.insert(arguments[..len].to_vec());
        }
    }
    prefixes.len() + 1
}

proptest! {
    #[test]
    fn prop_unregistering_everything_leaves_only_root((registered, order) in registrations()) {
        let publisher = DataTreeCandidatePublisher::new();
        let nodes: Vec<_> = registered
            .iter()
            .map(|(path, id)| publisher.register(path, *id))
            .collect();
        let count = publisher.registration_tree().take_snapshot().node_count();
        prop_assert_eq!(count, expected_nodes(registered.iter().map(|(path, _)| path)));

        for index in order {
            prop_assert!(publisher.unregister(nodes[index], &registered[index].1));
        }
        prop_assert_eq!(publisher.registration_tree().take_snapshot().node_count(), 1);
    }

    #[test]
    fn prop_pruning_keeps_exactly_live_prefixes(
        (registered, order) in registrations(),
        keep in 0usize..24,
    ) {
        let publisher = DataTreeCandidatePublisher::new();
        let nodes: Vec<_> = registered
            .iter()
            .map(|(path, id)| publisher.register(path, *id))
            .collect();

        let keep = keep.min(order.len());
        let (kept, removed) = order.split_at(keep);
        for &index in removed {
            prop_assert!(publisher.unregister(nodes[index], &registered[index].1));
        }
        let live = kept.iter().map(|&index| &registered[index].0);
        prop_assert_eq!(
            publisher.registration_tree().take_snapshot().node_count(),
            expected_nodes(live)
        );
    }
}

/// Keeps appended values in order; before start only the latest survives.
#[derive(Default)]
struct SequenceBuilder {
    values: Vec<u32>,
}

impl StateBuilder for SequenceBuilder {
    type State = Vec<u32>;

    fn append(&mut self, state: Vec<u32>) {
        self.values.extend(state);
    }

    fn append_initial(&mut self, state: Vec<u32>) {
        self.values.clear();
        self.values.extend(state.last().copied());
    }

    fn build(&mut self) -> Vec<u32> {
        std::mem::take(&mut self.values)
    }
}

#[derive(Clone, Default)]
struct SharedSink(Arc<Mutex<Vec<Vec<Vec<u32>>>>>);

impl StateSink<Vec<u32>> for SharedSink {
    fn notify_listener(&self, states: Vec<Vec<u32>>) {
        self.0.lock().push(states);
    }
}

/// Reports as (source, values); sources index into a fixed set of builders.
fn reports(sources: usize) -> impl Strategy<Value = Vec<(usize, Vec<u32>)>> {
    proptest::collection::vec((0..sources, proptest::collection::vec(any::<u32>(), 0..4)), 0..16)
}

proptest! {
    #[test]
    fn prop_aggregator_delivers_every_report(
        before in reports(3),
        after in reports(3),
    ) {
        let aggregator = StateAggregator::new(3);
        let builders: Vec<BuilderRef<SequenceBuilder>> = (0..3)
            .map(|_| aggregator.add_builder(SequenceBuilder::default()).unwrap())
            .collect();

        let mut expected: Vec<Vec<u32>> = vec![Vec::new(); 3];
        for (source, values) in &before {
            aggregator.receive_state(&builders[*source], values.clone());
            if let Some(last) = values.last() {
                expected[*source] = vec![*last];
            } else {
                expected[*source].clear();
            }
        }

        let sink = SharedSink::default();
        let downstream = sink.clone();
        aggregator
            .start(move |builders| {
                let operational = Operational::new(builders, Box::new(downstream));
                operational.notify_listener();
                Started::Operational(operational)
            })
            .unwrap();

        for (source, values) in &after {
            aggregator.receive_state(&builders[*source], values.clone());
            expected[*source].extend(values.iter().copied());
        }

        let mut delivered: Vec<Vec<u32>> = vec![Vec::new(); 3];
        for states in sink.0.lock().iter() {
            prop_assert_eq!(states.len(), 3);
            for (source, values) in states.iter().enumerate() {
                delivered[source].extend(values.iter().copied());
            }
        }
        prop_assert_eq!(delivered, expected);
    }
}
