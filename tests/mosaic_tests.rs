use clem_correlate::*;
use ndarray::{Array2, Array3};

fn stack_of(tile: Array2<f32>, offsets: Vec<(i64, i64)>) -> TileStack {
    let (rows, cols) = tile.dim();
    let mut tiles = Array3::<f32>::zeros((offsets.len(), rows, cols));
    for mut t in tiles.outer_iter_mut() {
        t.assign(&tile);
    }
    let heights = vec![0.0; offsets.len()];
    TileStack::new(tiles, offsets, heights, 2.0).unwrap()
}

#[test]
fn test_single_plane_passes_through() {
    let data = Array2::from_shape_fn((4, 6), |(r, c)| (r * 6 + c) as f32);
    let image = Image::new(data.clone(), 5.0);

    let mosaic = assemble_mosaic(&Montage::Single(image));

    assert_eq!(mosaic.image.data, data);
    assert_eq!(mosaic.image.pixel_size, 5.0);
    assert_eq!(mosaic.footprints.len(), 1);
    assert!(mosaic.counts.iter().all(|&c| c == 1));
}

#[test]
fn test_single_tile_stack_is_unchanged() {
    let tile = Array2::from_shape_fn((3, 3), |(r, c)| (r + c) as f32);
    let mosaic = assemble_mosaic(&Montage::Tiled(stack_of(tile.clone(), vec![(0, 0)])));
    assert_eq!(mosaic.image.data, tile);
}

#[test]
fn test_identical_overlapping_tiles_average_to_the_same_values() {
    let tile = Array2::from_elem((4, 4), 7.0f32);
    let mosaic = assemble_mosaic(&Montage::Tiled(stack_of(tile, vec![(0, 0), (2, 0)])));

    assert_eq!(mosaic.image.shape(), (4, 6));
    assert!(mosaic.image.data.iter().all(|&v| (v - 7.0).abs() < 1e-6));
    assert_eq!(mosaic.counts[[0, 0]], 1);
    assert_eq!(mosaic.counts[[0, 2]], 2);
    assert_eq!(mosaic.counts[[0, 5]], 1);
}

#[test]
fn test_uncovered_pixels_stay_zero() {
    let tile = Array2::from_elem((2, 2), 1.0f32);
    let mosaic = assemble_mosaic(&Montage::Tiled(stack_of(tile, vec![(0, 0), (1, 1)])));

    assert_eq!(mosaic.image.shape(), (3, 3));
    // (row 0, col 2) and (row 2, col 0) belong to no tile
    assert_eq!(mosaic.image.data[[0, 2]], 0.0);
    assert_eq!(mosaic.image.data[[2, 0]], 0.0);
    assert_eq!(mosaic.counts[[0, 2]], 0);
    assert_eq!(mosaic.image.data[[1, 1]], 1.0);
    assert_eq!(mosaic.counts[[1, 1]], 2);
}

#[test]
fn test_overlap_averages_differing_tiles() {
    let mut tiles = Array3::<f32>::zeros((2, 2, 2));
    tiles.index_axis_mut(ndarray::Axis(0), 0).fill(2.0);
    tiles.index_axis_mut(ndarray::Axis(0), 1).fill(4.0);
    let stack = TileStack::new(tiles, vec![(0, 0), (1, 0)], vec![0.0, 0.0], 1.0).unwrap();

    let mosaic = assemble_mosaic(&Montage::Tiled(stack));
    assert_eq!(mosaic.image.data[[0, 0]], 2.0);
    assert_eq!(mosaic.image.data[[0, 1]], 3.0);
    assert_eq!(mosaic.image.data[[0, 2]], 4.0);
}

#[test]
fn test_mismatched_offsets_are_rejected() {
    let tiles = Array3::<f32>::zeros((2, 2, 2));
    let err = TileStack::new(tiles, vec![(0, 0)], vec![0.0, 0.0], 1.0).unwrap_err();
    assert!(matches!(err, RegistrationError::InvalidInput(_)));
}

#[test]
fn test_negative_offsets_are_rejected() {
    let tiles = Array3::<f32>::zeros((1, 2, 2));
    let err = TileStack::new(tiles, vec![(-1, 0)], vec![0.0], 1.0).unwrap_err();
    assert!(matches!(err, RegistrationError::InvalidInput(_)));
}

#[test]
fn test_tile_lookup_prefers_nearest_centre() {
    let tile = Array2::from_elem((10, 10), 1.0f32);
    let mosaic = assemble_mosaic(&Montage::Tiled(stack_of(tile, vec![(0, 0), (6, 0)])));

    assert_eq!(mosaic.tile_at(Point2::new(1.0, 5.0)).unwrap(), 0);
    assert_eq!(mosaic.tile_at(Point2::new(14.0, 5.0)).unwrap(), 1);
    // overlap [6, 10): closer to the first tile's centre (5, 5)
    assert_eq!(mosaic.tile_at(Point2::new(7.0, 5.0)).unwrap(), 0);
    assert_eq!(mosaic.tile_at(Point2::new(9.0, 5.0)).unwrap(), 1);
}

#[test]
fn test_equidistant_tiles_are_ambiguous() {
    let tile = Array2::from_elem((10, 10), 1.0f32);
    let mosaic = assemble_mosaic(&Montage::Tiled(stack_of(tile, vec![(0, 0), (6, 0)])));

    // centres at x = 5 and x = 11
    let err = mosaic.tile_at(Point2::new(8.0, 5.0)).unwrap_err();
    match err {
        RegistrationError::IndexAmbiguity { candidates, .. } => assert_eq!(candidates, vec![0, 1]),
        other => panic!("unexpected error {other:?}"),
    }

    assert!(matches!(
        mosaic.tile_at(Point2::new(50.0, 5.0)),
        Err(RegistrationError::InvalidInput(_))
    ));
}

#[test]
fn test_tile_region_crops_the_canvas() {
    let tile = Array2::from_shape_fn((3, 3), |(r, c)| (r * 3 + c) as f32);
    let mosaic = assemble_mosaic(&Montage::Tiled(stack_of(tile.clone(), vec![(0, 0), (5, 2)])));

    let (offset, region) = mosaic.tile_region(1).unwrap();
    assert_eq!(offset, Point2::new(5.0, 2.0));
    assert_eq!(region.data, tile);
    assert!(mosaic.tile_region(2).is_err());
}

#[test]
fn test_downsampling_scales_offsets_and_pixel_size() {
    let tile = Array2::from_shape_fn((8, 8), |(r, c)| (r * 8 + c) as f32);
    let stack = stack_of(tile, vec![(0, 0), (4, 6)]);

    let small = stack.downsample(2);
    assert_eq!(small.tile_shape(), (4, 4));
    assert_eq!(small.offsets(), &[(0, 0), (2, 3)]);
    assert_eq!(small.pixel_size(), 4.0);
    assert_eq!(small.tile(0)[[1, 1]], 18.0);

    assert_eq!(stack.downsample(1), stack);
}
