use std::{collections::HashMap, hash::Hash};

use futures::{stream::FuturesUnordered, StreamExt};
use petgraph::{
    visit::{IntoNeighborsDirected, IntoNodeIdentifiers},
    Direction,
};
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
};
use tracing::trace;

/// Walks a task DAG in dependency order. Edges run producer ->
/// consumer, so a node becomes ready once every producer feeding it has
/// been marked done, and sources are emitted first.
///
/// A single driver task keeps a count of unfinished producers per node:
/// finishing a node releases its consumers, and a consumer whose count
/// reaches zero is emitted on the walk channel together with a oneshot
/// the caller fires when it is done with the node. This is the async
/// rendition of Kahn's algorithm, sized so that emission never blocks.
pub struct Walker<N, S> {
    marker: std::marker::PhantomData<S>,
    cancel: watch::Sender<bool>,
    node_events: Option<mpsc::Receiver<WalkMessage<N>>>,
    driver: Option<JoinHandle<()>>,
}

pub struct Start;
pub struct Walking;

pub type WalkMessage<N> = (N, oneshot::Sender<()>);

// Petgraph node ids are integers and already Copy + Eq, so the extra
// Hash + Send + 'static bounds cost nothing.
impl<N: Eq + Hash + Copy + Send + 'static> Walker<N, Start> {
    /// Create a walker for a DAG. The graph must not be modified after
    /// the walker is created; emitted nodes might no longer exist or
    /// might miss newly added edges.
    pub fn new<G: IntoNodeIdentifiers<NodeId = N> + IntoNeighborsDirected>(graph: G) -> Self {
        let (cancel, mut cancel_rx) = watch::channel(false);

        // Per node: how many producers still have to finish, and which
        // consumers to release once this node finishes.
        let mut producers_left: HashMap<N, usize> = HashMap::new();
        let mut consumers: HashMap<N, Vec<N>> = HashMap::new();
        for node in graph.node_identifiers() {
            producers_left.insert(
                node,
                graph.neighbors_directed(node, Direction::Incoming).count(),
            );
            consumers.insert(
                node,
                graph.neighbors_directed(node, Direction::Outgoing).collect(),
            );
        }

        // Each node is emitted at most once, so a buffer covering every
        // node keeps sends from blocking the driver.
        //
        // Always have at least 1 entry in buffer or this will panic
        let (node_tx, node_rx) = mpsc::channel(std::cmp::max(producers_left.len(), 1));

        let driver = tokio::spawn(async move {
            let mut ready: Vec<N> = producers_left
                .iter()
                .filter(|(_, left)| **left == 0)
                .map(|(node, _)| *node)
                .collect();
            let mut in_flight = FuturesUnordered::new();

            loop {
                while let Some(node) = ready.pop() {
                    let (done_tx, done_rx) = oneshot::channel::<()>();
                    if node_tx.send((node, done_tx)).await.is_err() {
                        // Receiver hung up without cancelling; no one is
                        // left to finish nodes, stop driving.
                        trace!("walk receiver dropped before the graph was exhausted");
                        return;
                    }
                    // A dropped callback counts as finished, so a caller
                    // that loses a node cannot wedge the walk.
                    in_flight.push(async move {
                        done_rx.await.ok();
                        node
                    });
                }

                if in_flight.is_empty() {
                    // Every reachable node was emitted and finished.
                    return;
                }

                tokio::select! {
                    // Prefer the cancel signal over releasing more nodes
                    biased;
                    _ = cancel_rx.changed() => {
                        // Either cancel() was called or the walker was
                        // dropped; nodes already sent stay readable.
                        return;
                    }
                    finished = in_flight.next() => {
                        let Some(node) = finished else { continue };
                        for consumer in consumers.remove(&node).unwrap_or_default() {
                            let left = producers_left
                                .get_mut(&consumer)
                                .expect("graph should have all nodes");
                            *left -= 1;
                            if *left == 0 {
                                ready.push(consumer);
                            }
                        }
                    }
                }
            }
        });

        Self {
            marker: std::marker::PhantomData,
            cancel,
            node_events: Some(node_rx),
            driver: Some(driver),
        }
    }

    /// Start the walk. Returns the walking-state walker and a channel
    /// that yields `(node, done)` pairs; the caller must fire `done`
    /// once it has finished processing the node.
    pub fn walk(self) -> (Walker<N, Walking>, mpsc::Receiver<WalkMessage<N>>) {
        let Self {
            cancel,
            mut node_events,
            driver,
            ..
        } = self;
        let node_events = node_events
            .take()
            .expect("walking graph with walker that has already been used");
        (
            Walker {
                marker: std::marker::PhantomData,
                cancel,
                node_events: None,
                driver,
            },
            node_events,
        )
    }
}

impl<N> Walker<N, Walking> {
    /// Cancel the walk. Nodes already queued for emission are still
    /// sent; no new nodes follow.
    pub fn cancel(&mut self) -> Result<(), watch::error::SendError<bool>> {
        self.cancel.send(true)
    }

    /// Consume the walker and wait for the driver to finish, mainly to
    /// make sure everything stopped after a cancel.
    pub async fn wait(self) -> Result<(), tokio::task::JoinError> {
        if let Some(driver) = self.driver {
            driver.await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use petgraph::Graph;

    use super::*;

    #[tokio::test]
    async fn producers_are_emitted_before_consumers() {
        // a -> b -> c, edges producer -> consumer
        let mut g = Graph::new();
        let a = g.add_node("a");
        let b = g.add_node("b");
        let c = g.add_node("c");
        g.add_edge(a, b, ());
        g.add_edge(b, c, ());

        let walker = Walker::new(&g);
        let mut visited = Vec::new();
        let (walker, mut node_emitter) = walker.walk();
        while let Some((index, done)) = node_emitter.recv().await {
            visited.push(index);
            done.send(()).unwrap();
        }
        walker.wait().await.unwrap();
        assert_eq!(visited, vec![a, b, c]);
    }

    #[tokio::test]
    async fn fan_in_waits_for_all_producers() {
        // a -> c <- b
        let mut g = Graph::new();
        let a = g.add_node("a");
        let b = g.add_node("b");
        let c = g.add_node("c");
        g.add_edge(a, c, ());
        g.add_edge(b, c, ());

        let walker = Walker::new(&g);
        let mut visited = Vec::new();
        let (walker, mut node_emitter) = walker.walk();
        while let Some((index, done)) = node_emitter.recv().await {
            visited.push(index);
            done.send(()).unwrap();
        }
        walker.wait().await.unwrap();
        assert_eq!(visited.len(), 3);
        assert_eq!(visited[2], c);
    }

    #[tokio::test]
    async fn independent_branches_are_released_together() {
        // a -> b, a -> c: finishing a frees both branches at once
        let mut g = Graph::new();
        let a = g.add_node("a");
        let b = g.add_node("b");
        let c = g.add_node("c");
        g.add_edge(a, b, ());
        g.add_edge(a, c, ());

        let walker = Walker::new(&g);
        let (walker, mut node_emitter) = walker.walk();

        let (first, done) = node_emitter.recv().await.unwrap();
        assert_eq!(first, a);
        done.send(()).unwrap();

        let mut tail = Vec::new();
        while let Some((index, done)) = node_emitter.recv().await {
            tail.push(index);
            done.send(()).unwrap();
        }
        walker.wait().await.unwrap();
        tail.sort();
        assert_eq!(tail, vec![b, c]);
    }

    #[tokio::test]
    async fn cancel_stops_new_emissions() {
        // a -> b -> c
        let mut g = Graph::new();
        let a = g.add_node("a");
        let b = g.add_node("b");
        let c = g.add_node("c");
        g.add_edge(a, b, ());
        g.add_edge(b, c, ());

        let walker = Walker::new(&g);
        let mut visited = Vec::new();
        let (mut walker, mut node_emitter) = walker.walk();
        while let Some((index, done)) = node_emitter.recv().await {
            // Cancel as soon as the first node arrives
            walker.cancel().unwrap();

            visited.push(index);
            done.send(()).unwrap();
        }
        assert_eq!(visited, vec![a]);

        let Walker { driver, .. } = walker;
        // Yield so the driver gets a chance to poll the cancel future
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(driver.expect("driver running").is_finished());
    }

    #[tokio::test]
    async fn dropped_done_callback_does_not_wedge_the_walk() {
        // a -> b; drop a's callback instead of firing it
        let mut g = Graph::new();
        let a = g.add_node("a");
        let b = g.add_node("b");
        g.add_edge(a, b, ());

        let walker = Walker::new(&g);
        let (walker, mut node_emitter) = walker.walk();

        let (first, done) = node_emitter.recv().await.unwrap();
        assert_eq!(first, a);
        drop(done);

        let (second, done) = node_emitter.recv().await.unwrap();
        assert_eq!(second, b);
        done.send(()).unwrap();
        walker.wait().await.unwrap();
    }
}
