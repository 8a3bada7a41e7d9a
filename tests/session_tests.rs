use clem_correlate::config::RegistrationConfig;
use clem_correlate::*;
use ndarray::Array2;
use tempfile::tempdir;

fn square(x0: f64, y0: f64, side: f64) -> Vec<Point2> {
    vec![
        Point2::new(x0, y0),
        Point2::new(x0 + side, y0),
        Point2::new(x0 + side, y0 + side),
        Point2::new(x0, y0 + side),
    ]
}

fn image(rows: usize, cols: usize, pixel_size: f64) -> Image {
    Image::new(
        Array2::from_shape_fn((rows, cols), |(r, c)| ((r * 7 + c * 3) % 50) as f32),
        pixel_size,
    )
}

fn new_session(target: Modality) -> CorrelationSession {
    CorrelationSession::new(
        ModalityState::new(Modality::Fluorescence, image(40, 40, 50.0)),
        ModalityState::new(target, image(60, 60, 10.0)),
    )
}

/// Source square (5,5)-(25,25) onto target square (10,10)-(40,40).
fn transformed_session() -> CorrelationSession {
    let mut session = new_session(Modality::Sem);
    session.define_source_grid(&square(5.0, 5.0, 20.0), None).unwrap();
    session.define_target_grid(&square(10.0, 10.0, 30.0), None).unwrap();
    session.transform_target_image().unwrap();
    session
}

fn source_points() -> Vec<Point2> {
    vec![
        Point2::new(6.0, 7.0),
        Point2::new(30.0, 9.0),
        Point2::new(28.0, 33.0),
        Point2::new(8.0, 29.0),
        Point2::new(18.0, 20.0),
    ]
}

fn add_offset_pairs(session: &mut CorrelationSession, dx: f64, dy: f64) {
    for p in source_points() {
        let mapped = session.map_point(p, None).unwrap();
        session
            .add_pair(p, None, Point2::new(mapped.x + dx, mapped.y + dy))
            .unwrap();
    }
}

#[test]
fn test_state_follows_the_workflow() {
    let mut session = new_session(Modality::Sem);
    assert_eq!(session.state(), RegistrationState::Undefined);

    session.define_source_grid(&square(5.0, 5.0, 20.0), None).unwrap();
    assert_eq!(session.state(), RegistrationState::Undefined);
    assert!(session.correspondence().is_none());

    session.define_target_grid(&square(10.0, 10.0, 30.0), None).unwrap();
    assert_eq!(session.state(), RegistrationState::GridDefined);
    assert!(session.correspondence().is_some());

    session.transform_target_image().unwrap();
    assert_eq!(session.state(), RegistrationState::Transformed);

    add_offset_pairs(&mut session, 1.0, -0.5);
    assert_eq!(session.state(), RegistrationState::PointsSelected);

    session.refine_selected().unwrap();
    assert_eq!(session.state(), RegistrationState::Refined);
    assert!(session.pairs().is_empty());
}

#[test]
fn test_pairs_need_a_transformed_target() {
    let mut session = new_session(Modality::Sem);
    session.define_source_grid(&square(5.0, 5.0, 20.0), None).unwrap();
    session.define_target_grid(&square(10.0, 10.0, 30.0), None).unwrap();

    let err = session
        .add_pair(Point2::new(1.0, 1.0), None, Point2::new(2.0, 2.0))
        .unwrap_err();
    assert!(matches!(err, RegistrationError::InvalidState(_)));
}

#[test]
fn test_grid_correspondence_maps_corners() {
    let session = transformed_session();

    let mapped = session.map_point(Point2::new(15.0, 15.0), None).unwrap();
    assert!(mapped.distance(&Point2::new(25.0, 25.0)) < 1e-9);

    let corner = session.map_point(Point2::new(25.0, 5.0), None).unwrap();
    assert!(corner.distance(&Point2::new(40.0, 10.0)) < 1e-9);
}

#[test]
fn test_flipped_source_pairs_mirrored_corners() {
    let mut session = transformed_session();
    session
        .set_source_orientation(Orientation {
            flip_horizontal: true,
            ..Default::default()
        })
        .unwrap();

    // (5, 5) becomes (34, 5) in the flipped source, the top-right corner
    let mapped = session.map_point(Point2::new(5.0, 5.0), None).unwrap();
    assert!(mapped.distance(&Point2::new(40.0, 10.0)) < 1e-9);
}

#[test]
fn test_raw_target_chain_undoes_target_grid() {
    let mut session = new_session(Modality::Sem);
    session.define_source_grid(&square(5.0, 5.0, 20.0), None).unwrap();
    let tilted = vec![
        Point2::new(12.0, 10.0),
        Point2::new(42.0, 12.0),
        Point2::new(40.0, 42.0),
        Point2::new(10.0, 40.0),
    ];
    session.define_target_grid(&tilted, None).unwrap();
    session.transform_target_image().unwrap();

    let grid = session.target().grid.clone().unwrap();
    let p = Point2::new(12.0, 20.0);
    let in_canvas = session.map_point(p, None).unwrap();
    let raw = session.map_point_raw(p, None).unwrap();

    assert!(grid.transform.apply(raw).distance(&in_canvas) < 1e-9);
}

#[test]
fn test_refinement_removes_systematic_offset() {
    let mut session = transformed_session();
    add_offset_pairs(&mut session, 1.0, -0.5);
    let targets: Vec<Point2> = session.pairs().iter().map(|p| p.target).collect();

    let precision = session.refine_selected().unwrap();
    assert!(precision.rms < 1e-9);

    for (p, target) in source_points().into_iter().zip(targets) {
        let mapped = session.map_point(p, None).unwrap();
        assert!(mapped.distance(&target) < 1e-9);
    }
}

#[test]
fn test_orientation_and_grids_lock_after_refinement() {
    let mut session = transformed_session();
    add_offset_pairs(&mut session, 0.5, 0.5);
    session.refine_selected().unwrap();

    let flip = Orientation {
        flip_vertical: true,
        ..Default::default()
    };
    assert!(matches!(
        session.set_source_orientation(flip),
        Err(RegistrationError::InvalidState(_))
    ));
    assert!(matches!(
        session.define_target_grid(&square(0.0, 0.0, 10.0), None),
        Err(RegistrationError::InvalidState(_))
    ));

    session.undo_refine().unwrap();
    assert!(session.set_source_orientation(flip).is_ok());
}

#[test]
fn test_undo_puts_pairs_back() {
    let mut session = transformed_session();
    add_offset_pairs(&mut session, 1.0, 1.0);
    let pairs = session.pairs().to_vec();
    let before = session.map_point(Point2::new(10.0, 10.0), None).unwrap();

    session.refine_selected().unwrap();
    assert!(session.precision().is_some());

    let round = session.undo_refine().unwrap();
    assert_eq!(round.pairs, pairs);
    assert_eq!(session.pairs(), pairs.as_slice());
    assert_eq!(session.state(), RegistrationState::PointsSelected);
    assert!(session.precision().is_none());
    let after = session.map_point(Point2::new(10.0, 10.0), None).unwrap();
    assert!(after.distance(&before) < 1e-12);

    assert!(matches!(
        session.undo_refine(),
        Err(RegistrationError::InvalidState(_))
    ));
}

#[test]
fn test_refinement_accepts_moved_target_peaks() {
    let mut session = transformed_session();
    let mut peak = Peak::new(20.0, 20.0);
    peak.move_to(21.0, 19.5);
    session.set_target_peaks(vec![peak]);

    add_offset_pairs(&mut session, 0.0, 0.0);
    session.refine_selected().unwrap();

    let peak = &session.target().peaks[0];
    assert!(!peak.moved);
    assert_eq!(peak.original(), (21.0, 19.5));
}

#[test]
fn test_source_peaks_map_individually() {
    let mut session = transformed_session();
    let mut with_z = Peak::new(15.0, 15.0);
    with_z.z = Some(3.0);
    session.set_source_peaks(vec![Peak::new(5.0, 25.0), with_z]);

    let mapped = session.map_peaks().unwrap();
    assert_eq!(mapped.len(), 2);
    assert!(mapped[0].as_ref().unwrap().distance(&Point2::new(40.0, 10.0)) < 1e-9);
    assert!(mapped[1].as_ref().unwrap().distance(&Point2::new(25.0, 25.0)) < 1e-9);
}

#[test]
fn test_fib_target_needs_z_positions() {
    let mut sem = transformed_session();
    assert!(matches!(
        sem.set_fib_projection(FibGeometry::default()),
        Err(RegistrationError::InvalidState(_))
    ));

    let mut session = new_session(Modality::Fib);
    session.define_source_grid(&square(5.0, 5.0, 20.0), None).unwrap();
    session.define_target_grid(&square(10.0, 10.0, 30.0), None).unwrap();
    session.transform_target_image().unwrap();
    session
        .set_fib_projection(FibGeometry {
            tilt_degrees: 52.0,
            z_scale: 2.0,
            z_origin: 5.0,
        })
        .unwrap();

    assert!(matches!(
        session.add_pair(Point2::new(10.0, 10.0), None, Point2::new(15.0, 15.0)),
        Err(RegistrationError::InvalidInput(_))
    ));
    assert!(session.map_point(Point2::new(10.0, 10.0), None).is_err());

    // on the reference slice the FIB chain matches the 2-D correspondence
    let mapped = session.map_point(Point2::new(15.0, 15.0), Some(5.0)).unwrap();
    assert!(mapped.distance(&Point2::new(25.0, 25.0)) < 1e-9);

    // one slice of 2 source pixels is 10 target pixels before the tilt
    let depth = 2.0 * (50.0 / 10.0) * 52f64.to_radians().tan();
    let deeper = session.map_point(Point2::new(15.0, 15.0), Some(6.0)).unwrap();
    assert!(deeper.distance(&Point2::new(25.0, 25.0 + depth)) < 1e-9);
}

#[test]
fn test_merge_warps_source_into_target_canvas() {
    let mut session = transformed_session();
    assert!(matches!(session.merge(), Err(RegistrationError::InvalidState(_))));

    add_offset_pairs(&mut session, 0.0, 0.0);
    session.refine_selected().unwrap();
    let target = session.target().transformed.clone().unwrap();

    let merged = session.merge().unwrap();
    assert_eq!(merged.num_channels(), 2);
    assert_eq!(merged.channel(1), target);
    // canvas (x 28, y 25) pulls from source (x 17, y 15) = (15 * 7 + 17 * 3) % 50
    assert!((merged.channels[[0, 25, 28]] - 6.0).abs() < 1e-3);
    assert!(session.merged_cache_valid());

    session.undo_refine().unwrap();
    assert!(!session.merged_cache_valid());
    assert!(session.merged().is_none());
}

#[test]
fn test_refinement_from_moved_target_peaks() {
    let mut session = transformed_session();
    let sources = source_points();
    let mut target_peaks = Vec::new();
    for (i, p) in sources.iter().enumerate() {
        let mapped = session.map_point(*p, None).unwrap();
        let mut peak = Peak::from_point(mapped);
        if i < 4 {
            peak.move_to(mapped.y - 0.5, mapped.x + 1.0);
        }
        target_peaks.push(peak);
    }
    session.set_source_peaks(sources.iter().copied().map(Peak::from_point).collect());
    session.set_target_peaks(target_peaks);
    assert!(session.pairs().is_empty());

    let precision = session.refine_selected().unwrap();
    assert!(precision.rms < 1e-9);
    assert_eq!(session.history().last().unwrap().pairs.len(), 4);
    assert!(session.target().peaks.iter().all(|p| !p.moved));

    for (p, peak) in sources.iter().zip(&session.target().peaks).take(4) {
        let mapped = session.map_point(*p, None).unwrap();
        assert!(mapped.distance(&peak.position()) < 1e-9);
    }
}

#[test]
fn test_too_few_moved_peaks_cannot_refine() {
    let mut session = transformed_session();
    let mut moved = Peak::new(20.0, 20.0);
    moved.move_to(21.0, 20.0);
    session.set_source_peaks(vec![Peak::new(10.0, 10.0), Peak::new(12.0, 12.0)]);
    session.set_target_peaks(vec![moved, Peak::new(30.0, 30.0)]);

    let err = session.refine_selected().unwrap_err();
    assert_eq!(err, RegistrationError::InsufficientPoints { required: 4, got: 1 });
}

#[test]
fn test_color_matrix_applies_before_orientation() {
    let flip = Orientation {
        flip_horizontal: true,
        ..Default::default()
    };
    let mut plain = transformed_session();
    plain.set_source_orientation(flip).unwrap();

    let mut session = transformed_session();
    session.set_source_orientation(flip).unwrap();
    session
        .set_color_matrix(Some(Transform::translation(2.0, 0.0)))
        .unwrap();

    let kinds: Vec<StageKind> = session.chain().unwrap().stages().iter().map(|s| s.kind).collect();
    assert_eq!(
        kinds,
        vec![StageKind::ColorChannel, StageKind::Orientation, StageKind::Correspondence]
    );

    // shift then flip: (5, 5) -> (7, 5) -> (32, 5)
    let shifted = session.map_point(Point2::new(5.0, 5.0), None).unwrap();
    let expected = plain.map_point(Point2::new(7.0, 5.0), None).unwrap();
    assert!(shifted.distance(&expected) < 1e-9);
    let flipped_first = plain.map_point(Point2::new(3.0, 5.0), None).unwrap();
    assert!(shifted.distance(&flipped_first) > 1.0);

    let singular = Transform::from_rows(
        [[0.0, 0.0, 0.0], [0.0, 0.0, 0.0], [0.0, 0.0, 1.0]],
        TransformKind::Affine,
    );
    assert!(session.set_color_matrix(Some(singular)).is_err());
}

#[test]
fn test_snapshot_round_trip() {
    let mut session = transformed_session();
    session.set_source_peaks(vec![Peak::new(12.0, 14.0)]);
    add_offset_pairs(&mut session, 1.0, -1.0);
    session.refine_selected().unwrap();
    session
        .add_pair(Point2::new(3.0, 3.0), None, Point2::new(8.0, 8.0))
        .unwrap();

    let dir = tempdir().unwrap();
    let path = dir.path().join("session.json");
    let snapshot = session.snapshot();
    snapshot.save_json(&path).unwrap();
    let loaded = SessionSnapshot::load_json(&path).unwrap();
    assert_eq!(loaded, snapshot);

    let restored = CorrelationSession::restore(
        &loaded,
        image(40, 40, 50.0),
        image(60, 60, 10.0),
        RegistrationConfig::default(),
    )
    .unwrap();

    assert_eq!(restored.id(), session.id());
    assert_eq!(restored.state(), session.state());
    assert_eq!(restored.pairs(), session.pairs());
    assert_eq!(restored.precision(), session.precision());
    assert_eq!(restored.source().peaks, session.source().peaks);
    assert_eq!(restored.target().transformed, session.target().transformed);
    let p = Point2::new(17.0, 11.0);
    assert!(
        restored
            .map_point(p, None)
            .unwrap()
            .distance(&session.map_point(p, None).unwrap())
            < 1e-12
    );
}

#[test]
fn test_restore_rejects_wrong_image_shape() {
    let session = transformed_session();
    let snapshot = session.snapshot();

    let err = CorrelationSession::restore(
        &snapshot,
        image(40, 40, 50.0),
        image(64, 64, 10.0),
        RegistrationConfig::default(),
    )
    .unwrap_err();
    assert!(matches!(err, RegistrationError::InvalidInput(_)));
}
