//! Link-state convergence across live routers on the in-process fabric

mod common;

use common::*;
use meshwork::network::memory::{MemoryNetwork, MemoryTransport};
use meshwork::{Router, Transport};
use std::sync::Arc;

#[tokio::test]
async fn two_nodes_discover_each_other() {
    let network = MemoryNetwork::new();
    let a = mesh_node(&network, peer(1));
    let b = mesh_node(&network, peer(2));

    network.link(peer(1), peer(2), 1);

    let route = wait_for_route(&a.router, peer(2)).await;
    assert_eq!(route.next_hop, peer(2));
    assert_eq!(route.cost, 1);
    wait_for_route(&b.router, peer(1)).await;

    assert!(a.delegate.found(peer(2)));
    assert!(b.delegate.found(peer(1)));

    let neighbors = a.router.neighbors().await.unwrap();
    assert_eq!(neighbors, vec![peer(2)]);
}

#[tokio::test]
async fn transport_module_wires_a_router() {
    let network = MemoryNetwork::new();
    let a = mesh_node(&network, peer(1));

    // The second router attaches through the Transport interface instead of
    // the fabric directly.
    let (delegate, _inbound) = RecordingDelegate::new();
    let b = Router::builder()
        .local_id(peer(2))
        .config(fast_config())
        .delegate(delegate as Arc<dyn meshwork::RouterDelegate>)
        .build();
    let transport = MemoryTransport::new(network.clone(), peer(2));
    transport.start(b.transport_events());

    network.link(peer(1), peer(2), 1);
    wait_for_route(&a.router, peer(2)).await;
    wait_for_route(&b, peer(1)).await;

    transport.stop();
}

#[tokio::test]
async fn line_topology_reaches_two_hops_out() {
    let network = MemoryNetwork::new();
    let a = mesh_node(&network, peer(1));
    let _b = mesh_node(&network, peer(2));
    let c = mesh_node(&network, peer(3));

    network.link(peer(1), peer(2), 1);
    network.link(peer(2), peer(3), 1);

    let route = wait_for_route(&a.router, peer(3)).await;
    assert_eq!(route.next_hop, peer(2));
    assert_eq!(route.cost, 2);

    let back = wait_for_route(&c.router, peer(1)).await;
    assert_eq!(back.next_hop, peer(2));
}

#[tokio::test]
async fn ring_converges_and_reroutes_after_edge_loss() {
    let network = MemoryNetwork::new();
    let a = mesh_node(&network, peer(1));
    let b = mesh_node(&network, peer(2));
    let c = mesh_node(&network, peer(3));
    let d = mesh_node(&network, peer(4));

    // Ring: A - B - C - D - A, unit costs.
    network.link(peer(1), peer(2), 1);
    network.link(peer(2), peer(3), 1);
    network.link(peer(3), peer(4), 1);
    network.link(peer(4), peer(1), 1);

    // Every router sees the other three.
    for node in [&a, &b, &c, &d] {
        for other in [peer(1), peer(2), peer(3), peer(4)] {
            if other != node.router.local_id() {
                wait_for_route(&node.router, other).await;
            }
        }
    }

    // Equal-cost tie to the opposite corner breaks on the smaller next hop.
    let route = wait_for_next_hop(&a.router, peer(3), peer(2)).await;
    assert_eq!(route.cost, 2);

    // Removing edge B-C forces A to reach C the long way round.
    network.unlink(peer(2), peer(3));
    let rerouted = wait_for_next_hop(&a.router, peer(3), peer(4)).await;
    assert_eq!(rerouted.cost, 2);
}

#[tokio::test]
async fn redundant_paths_deliver_reachability_once() {
    let network = MemoryNetwork::new();
    let a = mesh_node(&network, peer(1));
    let b = mesh_node(&network, peer(2));
    let c = mesh_node(&network, peer(3));

    // Full triangle: floods arrive at each node over two paths.
    network.link(peer(1), peer(2), 1);
    network.link(peer(2), peer(3), 1);
    network.link(peer(1), peer(3), 1);

    for node in [&a, &b, &c] {
        for other in [peer(1), peer(2), peer(3)] {
            if other != node.router.local_id() {
                wait_for_route(&node.router, other).await;
            }
        }
    }

    // Duplicate envelopes were dropped, so each peer was found exactly once.
    assert_eq!(a.delegate.found_count(peer(2)), 1);
    assert_eq!(a.delegate.found_count(peer(3)), 1);
    assert_eq!(b.delegate.found_count(peer(1)), 1);
    assert_eq!(b.delegate.found_count(peer(3)), 1);
    assert_eq!(c.delegate.found_count(peer(1)), 1);
    assert_eq!(c.delegate.found_count(peer(2)), 1);
}
