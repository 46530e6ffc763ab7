use crate::attributes::{
    AttributeGroup, AttributeGroupKind, Segment, SegmentList, Sided, SurfaceType,
};
use crate::config::ReimportConfig;
use crate::feature_source::{DlmFeature, FeatureSource, InMemoryFeatureSource, Partition};
use crate::graph_types::{Edge, EdgeId};
use crate::network::{Mutation, RoadNetwork};
use crate::reimport::{RETIREMENT_LABEL, Reimporter};
use crate::sink::RecordingSink;
use crate::statistics::ReimportStatistics;
use geo::{Coord, Rect, line_string};

fn init_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn reimport(
    network: &mut RoadNetwork,
    config: &ReimportConfig,
    features: Vec<DlmFeature>,
) -> (ReimportStatistics, RecordingSink) {
    init_logging();
    let mut source = InMemoryFeatureSource::new(features);
    let mut sink = RecordingSink::new();
    let stats = Reimporter::new(config)
        .run(network, &mut source, &mut sink)
        .unwrap();
    (stats, sink)
}

fn edge_for<'a>(network: &'a RoadNetwork, external_id: &str) -> &'a Edge {
    network
        .edge_by_external_id(external_id)
        .unwrap_or_else(|| panic!("no edge for {external_id}"))
}

fn left_surface(edge: &Edge) -> Vec<(f64, f64, SurfaceType)> {
    match edge.attributes.group(AttributeGroupKind::Surface) {
        Some(AttributeGroup::Surface(sided)) => sided
            .left
            .0
            .iter()
            .map(|s| (s.interval.start, s.interval.end, s.payload))
            .collect(),
        _ => panic!("surface group missing"),
    }
}

fn straight_e1() -> DlmFeature {
    DlmFeature::new("E1", line_string![(x: 0.0, y: 0.0), (x: 100.0, y: 0.0)])
}

#[test]
fn test_new_feature_creates_edge_and_nodes() {
    let config = ReimportConfig::default();
    let mut network = RoadNetwork::new();
    let (stats, sink) = reimport(&mut network, &config, vec![straight_e1()]);

    assert_eq!(stats.new_edges, 1);
    assert_eq!(stats.nodes_created, 2);
    assert!(!stats.is_failed());
    assert_eq!(sink.labels(), vec!["r0c0", RETIREMENT_LABEL]);

    let edge = edge_for(&network, "E1");
    let points: Vec<Coord> = [edge.from, edge.to]
        .iter()
        .map(|id| network.node(*id).unwrap().point)
        .collect();
    assert_eq!(points, vec![Coord { x: 0.0, y: 0.0 }, Coord { x: 100.0, y: 0.0 }]);
    for kind in AttributeGroupKind::ALL {
        let group = edge.attributes.group(kind).unwrap();
        assert!(group.is_neutral());
        assert!(group.covers_unit_interval());
    }
    let creates = sink
        .mutations()
        .filter(|m| matches!(m, Mutation::CreateNode(_) | Mutation::CreateEdge(_)))
        .count();
    assert_eq!(creates, 3);
}

#[test]
fn test_bent_geometry_keeps_identity_and_full_span() {
    let config = ReimportConfig::default();
    let mut network = RoadNetwork::new();
    reimport(&mut network, &config, vec![straight_e1()]);
    let before = edge_for(&network, "E1").clone();

    let bent = DlmFeature::new(
        "E1",
        line_string![(x: 0.0, y: 0.0), (x: 50.0, y: 5.0), (x: 100.0, y: 0.0)],
    );
    let (stats, _) = reimport(&mut network, &config, vec![bent.clone()]);

    assert_eq!(stats.simple_updates, 1);
    assert_eq!(stats.topological_updates, 0);
    let after = edge_for(&network, "E1");
    assert_eq!(after.id, before.id);
    assert_eq!((after.from, after.to), (before.from, before.to));
    assert_eq!(after.geometry, bent.geometry);
    assert_eq!(left_surface(after), vec![(0.0, 1.0, SurfaceType::Unknown)]);
    assert!(after.attributes.all_groups_cover_unit_interval());
}

#[test]
fn test_vanished_edge_split_into_two_features() {
    let config = ReimportConfig::default();
    let mut network = RoadNetwork::new();
    reimport(
        &mut network,
        &config,
        vec![DlmFeature::new("E", line_string![(x: 0.0, y: 0.0), (x: 100.0, y: 0.0)]).with_name("Auweg")],
    );
    let mut old = edge_for(&network, "E").clone();
    let segments = vec![
        Segment::new(0.0, 0.5, SurfaceType::Asphalt),
        Segment::new(0.5, 1.0, SurfaceType::Gravel),
    ];
    old.attributes.groups[0] = AttributeGroup::Surface(Sided {
        left: SegmentList(segments.clone()),
        right: SegmentList(segments),
    });
    network.update_edge(old.clone());
    network.drain_journal();

    let (stats, _) = reimport(
        &mut network,
        &config,
        vec![
            DlmFeature::new("E-a", line_string![(x: 0.0, y: 0.0), (x: 40.0, y: 0.0)]),
            DlmFeature::new("E-b", line_string![(x: 40.0, y: 0.0), (x: 100.0, y: 0.0)]),
        ],
    );

    assert_eq!(stats.new_edges, 2);
    assert_eq!(stats.splits, 1);
    assert_eq!(stats.edges_deleted, 1);
    assert_eq!(stats.post_run_topology_errors, 0);
    assert!(network.edge(old.id).is_none());
    assert_eq!(network.edge_count(), 2);
    assert_eq!(network.node_count(), 3);

    let first = edge_for(&network, "E-a");
    let second = edge_for(&network, "E-b");
    assert_eq!(first.to, second.from);
    assert_eq!(left_surface(first), vec![(0.0, 1.0, SurfaceType::Asphalt)]);
    assert_eq!(left_surface(second), vec![(0.0, 1.0, SurfaceType::Gravel)]);
    assert_eq!(second.attributes.name.as_deref(), Some("Auweg"));
}

#[test]
fn test_unchanged_reimport_is_idempotent() {
    let config = ReimportConfig::default();
    let mut network = RoadNetwork::new();
    let features = vec![
        straight_e1(),
        DlmFeature::new("E2", line_string![(x: 100.0, y: 0.0), (x: 100.0, y: 80.0)]),
        DlmFeature::new("E3", line_string![(x: 100.0, y: 80.0), (x: 0.0, y: 0.0)]),
    ];
    reimport(&mut network, &config, features.clone());
    let nodes_before = network.node_count();

    let (stats, sink) = reimport(&mut network, &config, features);
    assert_eq!(stats.unchanged, 3);
    assert_eq!(
        stats.new_edges + stats.simple_updates + stats.topological_updates + stats.splits,
        0
    );
    assert_eq!(sink.total_mutations(), 0);
    assert_eq!(network.node_count(), nodes_before);
}

#[test]
fn test_skipped_features_are_counted() {
    let config = ReimportConfig::default();
    let mut network = RoadNetwork::new();
    let ring = DlmFeature::new(
        "R",
        line_string![(x: 0.0, y: 0.0), (x: 10.0, y: 10.0), (x: 0.0, y: 10.0), (x: 0.0, y: 0.0)],
    );
    let footpath = DlmFeature::new("F", line_string![(x: 0.0, y: 0.0), (x: 0.0, y: 50.0)]).non_routable();

    let (stats, _) = reimport(
        &mut network,
        &config,
        vec![ring, footpath, straight_e1(), straight_e1()],
    );
    assert_eq!(stats.features_processed, 4);
    assert_eq!(stats.skipped_degenerate, 1);
    assert_eq!(stats.skipped_non_routable, 1);
    assert_eq!(stats.skipped_duplicate, 1);
    assert_eq!(stats.new_edges, 1);
    assert_eq!(network.edge_count(), 1);
}

#[test]
fn test_vanished_edge_without_replacement_is_deleted_with_its_nodes() {
    let config = ReimportConfig::default();
    let mut network = RoadNetwork::new();
    reimport(
        &mut network,
        &config,
        vec![
            straight_e1(),
            DlmFeature::new("GONE", line_string![(x: 500.0, y: 500.0), (x: 600.0, y: 500.0)]),
        ],
    );
    assert_eq!(network.node_count(), 4);

    let (stats, sink) = reimport(&mut network, &config, vec![straight_e1()]);
    assert_eq!(stats.edges_deleted, 1);
    assert_eq!(stats.nodes_deleted, 2);
    assert!(network.edge_by_external_id("GONE").is_none());
    assert_eq!(network.node_count(), 2);
    let deletes = sink
        .mutations()
        .filter(|m| matches!(m, Mutation::DeleteEdge(_) | Mutation::DeleteNode(_)))
        .count();
    assert_eq!(deletes, 3);
}

#[test]
fn test_features_across_partitions_share_border_node() {
    let config = ReimportConfig {
        partition_size: 50.0,
        ..Default::default()
    };
    let mut network = RoadNetwork::new();
    let (stats, sink) = reimport(
        &mut network,
        &config,
        vec![
            DlmFeature::new("W", line_string![(x: 0.0, y: 0.0), (x: 60.0, y: 0.0)]),
            DlmFeature::new("O", line_string![(x: 60.3, y: 0.0), (x: 120.0, y: 0.0)]),
        ],
    );

    assert_eq!(stats.new_edges, 2);
    assert_eq!(sink.labels(), vec!["r0c0", "r0c1", RETIREMENT_LABEL]);
    assert_eq!(network.node_count(), 3);
    assert_eq!(edge_for(&network, "W").to, edge_for(&network, "O").from);
}

#[test]
fn test_empty_delivery_fails_without_touching_the_network() {
    let config = ReimportConfig::default();
    let mut network = RoadNetwork::new();
    reimport(&mut network, &config, vec![straight_e1()]);

    let (stats, sink) = reimport(&mut network, &config, vec![]);
    assert!(stats.is_failed());
    assert_eq!(network.edge_count(), 1);
    assert!(sink.commits.is_empty());
}

struct BrokenSource;

impl FeatureSource for BrokenSource {
    fn extent(&self) -> Option<Rect> {
        Some(Rect::new(Coord { x: 0.0, y: 0.0 }, Coord { x: 10.0, y: 10.0 }))
    }

    fn features_in(&mut self, _partition: &Partition) -> anyhow::Result<Vec<DlmFeature>> {
        anyhow::bail!("connection reset while streaming features")
    }
}

#[test]
fn test_source_failure_aborts_the_run() {
    init_logging();
    let config = ReimportConfig::default();
    let mut network = RoadNetwork::new();
    let mut sink = RecordingSink::new();
    let mut reimporter = Reimporter::new(&config);

    let result = reimporter.run(&mut network, &mut BrokenSource, &mut sink);
    assert!(result.is_err());
    assert_eq!(reimporter.statistics().fatal_errors, 1);
    assert!(reimporter.statistics().is_failed());
    let reason = sink.aborted.as_deref().unwrap();
    assert!(reason.contains("connection reset"));
    assert!(sink.commits.is_empty());
}

#[test]
fn test_topology_correction_after_reimport() {
    let config = ReimportConfig {
        snap_tolerance: 0.5,
        merge_radius: 1.0,
        ..Default::default()
    };
    let mut network = RoadNetwork::new();
    let mut sink = RecordingSink::new();
    let mut reimporter = Reimporter::new(&config);
    let mut source = InMemoryFeatureSource::new(vec![
        DlmFeature::new("A", line_string![(x: 0.0, y: 0.0), (x: 50.0, y: 0.0)]),
        DlmFeature::new("B", line_string![(x: 50.8, y: 0.0), (x: 100.0, y: 0.0)]),
    ]);
    reimporter.run(&mut network, &mut source, &mut sink).unwrap();
    assert_eq!(network.node_count(), 4);

    let correction = reimporter.correct_topology(&mut network, &mut sink).unwrap();
    assert_eq!(correction.nodes_merged, 1);
    assert_eq!(reimporter.statistics().nodes_merged, 1);
    assert_eq!(network.node_count(), 3);
    let (a, b): (EdgeId, EdgeId) = (edge_for(&network, "A").id, edge_for(&network, "B").id);
    assert_eq!(network.edge(a).unwrap().to, network.edge(b).unwrap().from);
    assert_eq!(reimporter.statistics().post_run_topology_errors, 0);
}

#[test]
fn test_statistics_serialize_for_the_orchestrator() {
    let config = ReimportConfig::default();
    let mut network = RoadNetwork::new();
    let (stats, _) = reimport(&mut network, &config, vec![straight_e1()]);
    let json: serde_json::Value = serde_json::from_str(&stats.to_json().unwrap()).unwrap();
    assert_eq!(json["new_edges"], 1);
    assert_eq!(json["fatal_errors"], 0);
}

#[test]
fn test_geojson_delivery_end_to_end() {
    init_logging();
    let text = r#"{
        "type": "FeatureCollection",
        "features": [
            {
                "type": "Feature",
                "id": "DEBWL100",
                "geometry": {"type": "LineString", "coordinates": [[0, 0], [100, 0]]},
                "properties": {"name": "Talstrasse", "surface": "asphalt"}
            },
            {
                "type": "Feature",
                "id": "DEBWL101",
                "geometry": {"type": "LineString", "coordinates": [[100, 0], [100, 60]]},
                "properties": {"surface": "gravel"}
            }
        ]
    }"#;
    let config = ReimportConfig::default();
    let mut network = RoadNetwork::new();
    let mut source = crate::GeoJsonFeatureSource::from_geojson_str(text).unwrap();
    let mut sink = RecordingSink::new();
    let stats = Reimporter::new(&config)
        .run(&mut network, &mut source, &mut sink)
        .unwrap();

    assert_eq!(stats.new_edges, 2);
    assert!(!stats.is_failed());
    let talstrasse = edge_for(&network, "DEBWL100");
    assert_eq!(talstrasse.attributes.name.as_deref(), Some("Talstrasse"));
    assert_eq!(left_surface(talstrasse), vec![(0.0, 1.0, SurfaceType::Asphalt)]);
    assert_eq!(talstrasse.to, edge_for(&network, "DEBWL101").from);
}

#[test]
fn test_short_segment_survives_a_simple_update() {
    let config = ReimportConfig::default();
    let mut network = RoadNetwork::new();
    reimport(&mut network, &config, vec![straight_e1()]);
    let mut edge = edge_for(&network, "E1").clone();
    let segments = vec![
        Segment::new(0.0, 0.1, SurfaceType::Asphalt),
        Segment::new(0.1, 1.0, SurfaceType::Gravel),
    ];
    edge.attributes.groups[0] = AttributeGroup::Surface(Sided {
        left: SegmentList(segments.clone()),
        right: SegmentList(segments),
    });
    network.update_edge(edge);
    network.drain_journal();

    let bent = DlmFeature::new(
        "E1",
        line_string![(x: 0.0, y: 0.0), (x: 50.0, y: 5.0), (x: 100.0, y: 0.0)],
    );
    let (stats, _) = reimport(&mut network, &config, vec![bent]);

    assert_eq!(stats.simple_updates, 1);
    assert_eq!(stats.attribute_resets, 0);
    assert_eq!(
        left_surface(edge_for(&network, "E1")),
        vec![(0.0, 0.1, SurfaceType::Asphalt), (0.1, 1.0, SurfaceType::Gravel)]
    );
}

#[test]
fn test_pinned_topological_update_is_idempotent() {
    let config = ReimportConfig::default();
    let mut network = RoadNetwork::new();
    reimport(&mut network, &config, vec![straight_e1()]);

    let drifted = DlmFeature::new("E1", line_string![(x: 0.0, y: 0.0), (x: 101.5, y: 0.0)]);
    let (stats, _) = reimport(&mut network, &config, vec![drifted.clone()]);
    assert_eq!(stats.topological_updates, 1);
    assert_eq!(stats.post_run_topology_errors, 0);

    let (stats, sink) = reimport(&mut network, &config, vec![drifted]);
    assert_eq!(stats.unchanged, 1);
    assert_eq!(
        stats.simple_updates + stats.topological_updates + stats.non_split_topological_changes,
        0
    );
    assert_eq!(sink.total_mutations(), 0);
}
