use crate::peaks::PeakDetection;
use crate::registration::{GridDefinition, PrecisionEstimate};

pub fn print_grid(label: &str, grid: &GridDefinition) {
    println!("=== Grid Square ({}) ===", label);
    println!("  Side length: {:.3} px (std {:.3})", grid.side_length, grid.side_std);
    println!("  Mode: {:?}", grid.mode);
    println!("  Output shape: {} x {}", grid.output_shape.1, grid.output_shape.0);
    for row in grid.transform.to_rows() {
        println!("  [{:>10.4} {:>10.4} {:>10.4}]", row[0], row[1], row[2]);
    }
    println!();
}

pub fn print_peak_summary(label: &str, detection: &PeakDetection, peaks: usize) {
    println!("=== Peaks ({}) ===", label);
    println!("  Threshold: {:.2}", detection.threshold);
    println!("  Components: {}", detection.outcomes.len());
    println!("  Unresolved overlaps: {}", detection.unresolved_count());
    println!("  Peaks: {}", peaks);
    println!();
}

pub fn print_precision(precision: &PrecisionEstimate) {
    println!("=== Registration Precision ===");
    println!("  x: \u{00B1}{:.2}, y: \u{00B1}{:.2}", precision.std.0, precision.std.1);
    println!("  RMS: {:.3}", precision.rms);
    println!(
        "  Covariance: [[{:.3}, {:.3}], [{:.3}, {:.3}]]",
        precision.covariance[0][0],
        precision.covariance[0][1],
        precision.covariance[1][0],
        precision.covariance[1][1]
    );
    println!();

    println!("| Point | dx | dy | Distance |");
    println!("|-------|----|----|----------|");
    for (i, (r, d)) in precision.residuals.iter().zip(&precision.distances).enumerate() {
        println!("| {} | {:.3} | {:.3} | {:.3} |", i, r.x, r.y, d);
    }

    if !precision.convergence.is_empty() {
        println!();
        println!("| Points | RMS |");
        println!("|--------|-----|");
        for point in &precision.convergence {
            println!("| {} | {:.3} |", point.points, point.rms);
        }
    }
}
