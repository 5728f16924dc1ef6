//! End-to-end pipeline tests over real temp files.

use std::fs;
use std::path::Path;

use campaign_pipeline::core::RawSource;
use campaign_pipeline::pipeline::Pipeline;
use campaign_pipeline::store::StoreReader;
use campaign_pipeline::{PipelineConfig, SiteConfig};
use serde_json::Value;

fn pipeline() -> Pipeline {
    Pipeline::new(&PipelineConfig::default())
}

fn read_packets(path: &Path) -> Vec<Value> {
    serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap()
}

#[test]
fn three_point_granule_round_trips_to_store_and_packets() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("granule.csv");
    fs::write(
        &input,
        "lon,lat,alt,time,intensity\n\
         0.0,0.0,0.0,0,5\n\
         1.0,1.0,1.0,1,7\n\
         2.0,2.0,2.0,2,3\n",
    )
    .unwrap();

    let store_dest = dir.path().join("granule.store");
    let viz_dest = dir.path().join("granule.viz.json");
    let output = pipeline()
        .run(&RawSource::new(&input), &store_dest, &viz_dest)
        .unwrap();

    assert_eq!(output.format, "point-csv");
    assert_eq!(output.store.point_count, 3);
    assert_eq!(output.store.epoch, 0);

    // Read the store back through its own accessor.
    let reader = StoreReader::open(&store_dest).unwrap();
    let meta = reader.metadata();
    assert_eq!(meta.point_count, 3);
    assert_eq!(meta.num_chunks, 1);
    assert!(meta.arrays.contains_key("intensity"));

    let locations = reader.read_location_chunk(0).unwrap();
    assert_eq!(locations.len(), 3);
    for (i, loc) in locations.iter().enumerate() {
        let expected = i as f64;
        assert!((loc[0] - expected).abs() < 1e-9);
        assert!((loc[1] - expected).abs() < 1e-9);
        assert!((loc[2] - expected).abs() < 1e-9);
    }
    assert_eq!(reader.read_time_chunk(0).unwrap(), vec![0, 1, 2]);
    let intensity = reader.read_attribute_chunk("intensity", 0).unwrap();
    let values: Vec<f64> = (0..3).map(|i| intensity.value_as_f64(i)).collect();
    assert_eq!(values, vec![5.0, 7.0, 3.0]);

    // Packet stream: three packets, interval starts at t=0,1,2 in order.
    assert_eq!(output.viz.packet_count, 3);
    let packets = read_packets(&viz_dest);
    let starts: Vec<&str> = packets
        .iter()
        .map(|p| p["timeInterval"][0].as_str().unwrap())
        .collect();
    assert_eq!(
        starts,
        vec![
            "1970-01-01T00:00:00Z",
            "1970-01-01T00:00:01Z",
            "1970-01-01T00:00:02Z"
        ]
    );
}

#[test]
fn detection_returns_the_exact_format_and_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();

    let point = dir.path().join("points.csv");
    fs::write(&point, "lon,lat,alt,time\n1.0,2.0,3.0,4\n").unwrap();

    let sweep = dir.path().join("sweep_20170517.csv");
    fs::write(&sweep, "Status,Scale,Range,Gain,Angle,Echo_0\n0,100,50,40,0,5\n").unwrap();

    let ply = dir.path().join("cloud.ply");
    fs::write(
        &ply,
        "ply\nformat ascii 1.0\nelement vertex 1\n\
         property float x\nproperty float y\nproperty float z\nproperty float time\n\
         end_header\n0.0 0.0 0.0 0\n",
    )
    .unwrap();

    let pipeline = pipeline();
    for (path, expected) in [
        (&point, "point-csv"),
        (&sweep, "sweep-csv"),
        (&ply, "ply"),
    ] {
        let source = RawSource::new(path);
        for _ in 0..2 {
            let resolved = pipeline.registry().resolve(&source).unwrap().format_id();
            assert_eq!(resolved, expected, "for {}", path.display());
        }
    }
}

#[test]
fn sweep_granule_runs_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("sweep_20170517.csv");
    fs::write(
        &input,
        "Status,Scale,Range,Gain,Angle,Echo_0,Echo_1,Echo_2,Echo_3\n\
         0,100,50,40,0,0,10,0,20\n\
         0,100,50,40,1024,0,0,30,0\n\
         0,100,50,40,2049,15,0,0,25\n",
    )
    .unwrap();

    let config = PipelineConfig {
        site: SiteConfig {
            origin_lon: -75.5,
            origin_lat: 38.0,
            origin_alt: 10.0,
        },
        ..PipelineConfig::default()
    };
    let store_dest = dir.path().join("sweep.store");
    let viz_dest = dir.path().join("sweep.viz.json");
    let output = Pipeline::new(&config)
        .run(&RawSource::new(&input), &store_dest, &viz_dest)
        .unwrap();

    assert_eq!(output.format, "sweep-csv");
    // Five echoes above the zero threshold.
    assert_eq!(output.store.point_count, 5);
    assert_eq!(output.viz.packet_count, 5);

    let reader = StoreReader::open(&store_dest).unwrap();
    let locations = reader.read_location_chunk(0).unwrap();
    // Everything lands near the site origin.
    for loc in &locations {
        assert!((loc[0] - -75.5).abs() < 0.01);
        assert!((loc[1] - 38.0).abs() < 0.01);
        assert_eq!(loc[2], 10.0);
    }
    // Acquisition date from the file name: 2017-05-17.
    assert_eq!(
        reader.metadata().epoch_iso.split('T').next().unwrap(),
        "2017-05-17"
    );
}

#[test]
fn ply_granule_runs_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("cloud.ply");
    fs::write(
        &input,
        "ply\n\
         format ascii 1.0\n\
         element vertex 3\n\
         property float x\n\
         property float y\n\
         property float z\n\
         property float gps_time\n\
         property float intensity\n\
         end_header\n\
         0.0 0.0 50.0 1494979200 0.5\n\
         10.0 0.0 55.0 1494979201 0.7\n\
         20.0 0.0 60.0 1494979202 0.3\n",
    )
    .unwrap();

    let store_dest = dir.path().join("cloud.store");
    let viz_dest = dir.path().join("cloud.viz.json");
    let output = pipeline()
        .run(&RawSource::new(&input), &store_dest, &viz_dest)
        .unwrap();

    assert_eq!(output.format, "ply");
    assert_eq!(output.store.point_count, 3);
    assert_eq!(output.store.epoch, 1_494_979_200);
    assert_eq!(output.viz.packet_count, 3);

    let packets = read_packets(&viz_dest);
    assert_eq!(
        packets[0]["timeInterval"][0].as_str().unwrap(),
        "2017-05-17T00:00:00Z"
    );
}

#[test]
fn failed_conversion_leaves_no_outputs() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("broken.csv");
    fs::write(&input, "lon,lat,alt,time\n1.0,2.0,not-a-number,4\n").unwrap();

    let store_dest = dir.path().join("broken.store");
    let viz_dest = dir.path().join("broken.viz.json");
    let err = pipeline()
        .run(&RawSource::new(&input), &store_dest, &viz_dest)
        .unwrap_err();

    assert!(format!("{:#}", err).contains("altitude"));
    assert!(!store_dest.exists());
    assert!(!viz_dest.exists());
}
