use clap::Parser;
use log::{debug, info};
use rayon::prelude::*;
use rustc_hash::{FxHashMap, FxHashSet};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "gfacontact")]
#[command(about = "Render a contact map of a variation graph.", long_about = None)]
struct Args {
    // MANDATORY OPTIONS
    /// Load the variation graph in GFA format from this FILE.
    #[arg(short = 'i', long = "idx", value_name = "FILE")]
    idx: PathBuf,

    /// Write the contact map to this FILE (format chosen by extension).
    #[arg(short = 'o', long = "out", value_name = "FILE")]
    out: PathBuf,

    // Visualization Options
    /// Set the width in pixels of the output image.
    #[arg(short = 'x', long = "width", value_name = "N", default_value_t = 1000)]
    width: u32,

    /// Set the height in pixels of the output image.
    #[arg(short = 'y', long = "height", value_name = "N", default_value_t = 1000)]
    height: u32,

    /// Accumulation strength in [0, 1] applied per visit to a pixel.
    #[arg(short = 'a', long = "alpha", value_name = "FLOAT", default_value_t = 1.0)]
    alpha: f32,

    // Threading
    /// Number of threads to use for parallel operations.
    #[arg(short = 't', long = "threads", value_name = "N")]
    threads: Option<usize>,

    // Logging
    /// Verbosity level (0 = error, 1 = info, 2 = debug).
    #[arg(short = 'v', long = "verbose", value_name = "N", default_value_t = 1)]
    verbose: u8,
}

/// A segment (node) in the graph
#[derive(Debug, Clone)]
struct Segment {
    sequence_len: u64,
}

/// An edge between two segments. Orientation only matters for
/// deduplication; positioning on the linear axis ignores it.
#[derive(Debug, Clone)]
struct Edge {
    from_id: u64,
    to_id: u64,
}

/// A step in a path: (segment_id, is_reverse)
#[derive(Debug, Clone)]
struct PathStep {
    segment_id: u64,
    is_reverse: bool,
}

/// Minimal graph representation for the contact map
struct Graph {
    segments: Vec<Segment>,
    segment_name_to_id: FxHashMap<String, u64>,
    edges: Vec<Edge>,
    forward_adjacency: Vec<Vec<u64>>,
    reverse_adjacency: Vec<Vec<u64>>,
}

/// Canonical edge key for deduplication
fn edge_key(from_id: u64, from_rev: bool, to_id: u64, to_rev: bool) -> (u64, bool, u64, bool) {
    // Normalize edge direction for deduplication
    if from_id < to_id || (from_id == to_id && !from_rev) {
        (from_id, from_rev, to_id, to_rev)
    } else {
        (to_id, !to_rev, from_id, !from_rev)
    }
}

impl Graph {
    fn new() -> Self {
        Graph {
            segments: Vec::new(),
            segment_name_to_id: FxHashMap::default(),
            edges: Vec::new(),
            forward_adjacency: Vec::new(),
            reverse_adjacency: Vec::new(),
        }
    }

    fn node_count(&self) -> usize {
        self.segments.len()
    }

    fn get_length(&self, id: u64) -> u64 {
        self.segments[id as usize].sequence_len
    }

    /// Iterate the segments connected to `id`: outgoing targets in the
    /// forward orientation, incoming sources in the reverse orientation.
    fn follow_edges(&self, id: u64, reverse: bool) -> impl Iterator<Item = u64> + '_ {
        let adjacency = if reverse {
            &self.reverse_adjacency
        } else {
            &self.forward_adjacency
        };
        adjacency[id as usize].iter().copied()
    }
}

/// Parse a GFA file into the minimal structures the renderer needs
fn parse_gfa(path: &Path) -> std::io::Result<Graph> {
    let mut graph = Graph::new();

    info!("Loading GFA file...");

    // First pass: collect segments
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    for line in reader.lines() {
        let line = line?;
        if line.starts_with("S\t") {
            let parts: Vec<&str> = line.split('\t').collect();
            if parts.len() >= 3 {
                let name = parts[1].to_string();
                let seq_len = parts[2].len() as u64;
                let id = graph.segments.len() as u64;
                graph.segment_name_to_id.insert(name, id);
                graph.segments.push(Segment { sequence_len: seq_len });
            }
        }
    }

    info!("Found {} segments", graph.segments.len());

    // Use a set to deduplicate edges
    let mut edge_set: FxHashSet<(u64, bool, u64, bool)> = FxHashSet::default();
    let mut paths: Vec<Vec<PathStep>> = Vec::new();

    // Second pass: collect explicit edges (L-lines) and path steps (P/W-lines)
    let file2 = File::open(path)?;
    let reader2 = BufReader::new(file2);
    for line in reader2.lines() {
        let line = line?;
        if line.starts_with("L\t") {
            // Parse edge: L<TAB>from<TAB>from_orient<TAB>to<TAB>to_orient<TAB>overlap
            let parts: Vec<&str> = line.split('\t').collect();
            if parts.len() >= 5 {
                let from_name = parts[1];
                let from_orient = parts[2];
                let to_name = parts[3];
                let to_orient = parts[4];

                if let (Some(&from_id), Some(&to_id)) = (
                    graph.segment_name_to_id.get(from_name),
                    graph.segment_name_to_id.get(to_name),
                ) {
                    let from_rev = from_orient == "-";
                    let to_rev = to_orient == "-";
                    edge_set.insert(edge_key(from_id, from_rev, to_id, to_rev));
                }
            }
        } else if line.starts_with("P\t") {
            let parts: Vec<&str> = line.split('\t').collect();
            if parts.len() >= 3 {
                let segments_str = parts[2];
                let mut steps = Vec::new();

                for seg in segments_str.split(',') {
                    let seg = seg.trim();
                    if seg.is_empty() {
                        continue;
                    }
                    let (name, is_reverse) = if seg.ends_with('+') {
                        (&seg[..seg.len() - 1], false)
                    } else if seg.ends_with('-') {
                        (&seg[..seg.len() - 1], true)
                    } else {
                        (seg, false)
                    };
                    if let Some(&id) = graph.segment_name_to_id.get(name) {
                        steps.push(PathStep { segment_id: id, is_reverse });
                    }
                }

                paths.push(steps);
            }
        } else if line.starts_with("W\t") {
            let parts: Vec<&str> = line.split('\t').collect();
            if parts.len() >= 7 {
                let walk_str = parts[6];
                let mut steps = Vec::new();

                let mut chars = walk_str.chars().peekable();
                while let Some(c) = chars.next() {
                    if c == '>' || c == '<' {
                        let is_reverse = c == '<';
                        let mut seg_name = String::new();
                        while let Some(&nc) = chars.peek() {
                            if nc == '>' || nc == '<' {
                                break;
                            }
                            seg_name.push(chars.next().unwrap());
                        }
                        if !seg_name.is_empty() {
                            if let Some(&id) = graph.segment_name_to_id.get(&seg_name) {
                                steps.push(PathStep { segment_id: id, is_reverse });
                            }
                        }
                    }
                }

                paths.push(steps);
            }
        }
    }

    // Implicit edges: every pair of consecutive steps in every path
    let implicit: FxHashSet<(u64, bool, u64, bool)> = paths
        .par_iter()
        .flat_map_iter(|steps| {
            steps.windows(2).map(|w| {
                edge_key(w[0].segment_id, w[0].is_reverse, w[1].segment_id, w[1].is_reverse)
            })
        })
        .collect();
    edge_set.extend(implicit);

    // Convert edge set to vector
    for (from_id, _, to_id, _) in edge_set {
        graph.edges.push(Edge { from_id, to_id });
    }

    // Adjacency lists back the directed edge iteration
    graph.forward_adjacency = vec![Vec::new(); graph.segments.len()];
    graph.reverse_adjacency = vec![Vec::new(); graph.segments.len()];
    for edge in &graph.edges {
        graph.forward_adjacency[edge.from_id as usize].push(edge.to_id);
        graph.reverse_adjacency[edge.to_id as usize].push(edge.from_id);
    }

    info!("Found {} paths, {} edges", paths.len(), graph.edges.len());

    Ok(graph)
}

/// Linear layout: every segment gets a cumulative offset on a single axis
struct Layout {
    offsets: FxHashMap<u64, u64>,
    total_len: u64,
}

/// Lay all segments end to end in iteration order.
/// Invariant: offset(e_{i+1}) = offset(e_i) + length(e_i), no gaps.
fn layout_nodes(graph: &Graph) -> Layout {
    let mut offsets = FxHashMap::default();
    let mut len = 0u64;
    for id in 0..graph.node_count() as u64 {
        offsets.insert(id, len);
        len += graph.get_length(id);
    }
    Layout { offsets, total_len: len }
}

/// Uniform scale mapping the linear axis onto the pixel width.
/// Computed once and reused for every coordinate transform; a zero-length
/// axis has no defined scale and must be rejected before any canvas work.
fn compute_scale(width: u32, total_len: u64) -> Option<f64> {
    if total_len == 0 {
        None
    } else {
        Some(width as f64 / total_len as f64)
    }
}

/// RGBA canvas accumulating contact density, addressed in the linear
/// (unscaled) coordinate domain
struct ContactCanvas {
    width: u32,
    height: u32,
    scale: f64,
    v: u8,
    pixels: Vec<u8>,
}

impl ContactCanvas {
    fn new(width: u32, height: u32, scale: f64, alpha: f32) -> Self {
        ContactCanvas {
            width,
            height,
            scale,
            v: (255.0 * alpha).round() as u8,
            pixels: vec![255u8; width as usize * height as usize * 4],
        }
    }

    /// One pixel expressed in the linear domain; the step between marks
    /// that keeps consecutive marks on adjacent or identical pixels.
    fn linear_step(&self) -> f64 {
        1.0 / self.scale
    }

    /// Darken the pixel addressed by the given linear-domain coordinates.
    /// R, G and B shrink by the accumulation value without wrapping; the
    /// alpha channel becomes fully opaque on every visit.
    fn accumulate(&mut self, x: f64, y: f64) {
        let px = ((x * self.scale).round() as u64).min(self.width as u64 - 1) as usize;
        let py = ((y * self.scale).round() as u64).min(self.height as u64 - 1) as usize;
        let idx = 4 * (py * self.width as usize + px);
        self.pixels[idx] = self.pixels[idx].saturating_sub(self.v);
        self.pixels[idx + 1] = self.pixels[idx + 1].saturating_sub(self.v);
        self.pixels[idx + 2] = self.pixels[idx + 2].saturating_sub(self.v);
        self.pixels[idx + 3] = 255;
    }

    fn into_pixels(self) -> Vec<u8> {
        self.pixels
    }
}

/// Mark every base position of every segment along the y = 0 baseline
fn draw_nodes(canvas: &mut ContactCanvas, graph: &Graph, layout: &Layout) {
    for id in 0..graph.node_count() as u64 {
        let p = layout.offsets[&id];
        let hl = graph.get_length(id);
        for i in 0..hl {
            canvas.accumulate((p + i) as f64, 0.0);
        }
    }
}

/// Draw the staircase connecting two mapped positions: a vertical stroke at
/// each endpoint spanning the distance between them, joined by a horizontal
/// run at the far extent. The walks are driven by an integer mark index so
/// they terminate at any scale factor.
fn draw_edge(canvas: &mut ContactCanvas, pos_h: u64, pos_o: u64) {
    let a = pos_h.min(pos_o) as f64;
    let b = pos_h.max(pos_o) as f64;
    let dist = b - a;
    let step = canvas.linear_step();
    // all three walks cover a span of `dist`, one mark per pixel
    let marks = (dist / step).ceil() as u64;

    for k in 0..marks {
        canvas.accumulate(a, k as f64 * step);
    }
    for k in 0..marks {
        canvas.accumulate(a + k as f64 * step, dist);
    }
    for k in 0..marks {
        canvas.accumulate(b, k as f64 * step);
    }
}

/// Mark every forward edge as a staircase between its endpoints' positions
fn draw_edges(canvas: &mut ContactCanvas, graph: &Graph, layout: &Layout) {
    let node_count = graph.node_count() as u64;
    for id in 0..node_count {
        if (id + 1) % 100 == 0 {
            debug!("adding edges for segment {} of {}", id + 1, node_count);
        }
        let p = layout.offsets[&id];
        for o in graph.follow_edges(id, false) {
            draw_edge(canvas, p, layout.offsets[&o]);
        }
    }
}

/// Encode the finished RGBA buffer to the output file
fn write_image(out: &Path, width: u32, height: u32, pixels: Vec<u8>) -> image::ImageResult<()> {
    let img = image::RgbaImage::from_raw(width, height, pixels)
        .expect("canvas buffer does not match its dimensions");
    img.save(out)
}

fn main() {
    let args = Args::parse();

    // Initialize logger based on verbosity
    env_logger::Builder::new()
        .filter_level(match args.verbose {
            0 => log::LevelFilter::Error,
            1 => log::LevelFilter::Info,
            _ => log::LevelFilter::Debug,
        })
        .init();

    if let Some(threads) = args.threads {
        if let Err(e) = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build_global()
        {
            eprintln!("Error configuring thread pool: {}", e);
            std::process::exit(1);
        }
    }

    if args.width == 0 || args.height == 0 {
        eprintln!("Error: width and height must be positive");
        std::process::exit(1);
    }

    if !(0.0..=1.0).contains(&args.alpha) {
        eprintln!("Error: alpha must be in [0, 1], got {}", args.alpha);
        std::process::exit(1);
    }

    let graph = match parse_gfa(&args.idx) {
        Ok(g) => g,
        Err(e) => {
            eprintln!("Error loading GFA file: {}", e);
            std::process::exit(1);
        }
    };

    let layout = layout_nodes(&graph);
    info!(
        "Laid out {} segments over {} bp",
        graph.node_count(),
        layout.total_len
    );

    let scale = match compute_scale(args.width, layout.total_len) {
        Some(s) => s,
        None => {
            eprintln!("Error: graph has no sequence to visualize (total length is zero)");
            std::process::exit(1);
        }
    };
    debug!("scale: {:.6} ({} px / {} bp)", scale, args.width, layout.total_len);

    let mut canvas = ContactCanvas::new(args.width, args.height, scale, args.alpha);

    info!("Rendering contact map...");
    draw_nodes(&mut canvas, &graph, &layout);
    draw_edges(&mut canvas, &graph, &layout);

    info!("Saving to {:?}...", args.out);
    if let Err(e) = write_image(&args.out, args.width, args.height, canvas.into_pixels()) {
        eprintln!("Error saving image: {}", e);
        std::process::exit(1);
    }

    info!("Done.");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn test_graph(lengths: &[u64], edges: &[(u64, u64)]) -> Graph {
        let mut graph = Graph::new();
        for (i, &len) in lengths.iter().enumerate() {
            graph
                .segment_name_to_id
                .insert(format!("s{}", i + 1), i as u64);
            graph.segments.push(Segment { sequence_len: len });
        }
        graph.forward_adjacency = vec![Vec::new(); lengths.len()];
        graph.reverse_adjacency = vec![Vec::new(); lengths.len()];
        for &(from, to) in edges {
            graph.edges.push(Edge {
                from_id: from,
                to_id: to,
            });
            graph.forward_adjacency[from as usize].push(to);
            graph.reverse_adjacency[to as usize].push(from);
        }
        graph
    }

    fn px(canvas: &ContactCanvas, x: u32, y: u32) -> [u8; 4] {
        let idx = 4 * (y as usize * canvas.width as usize + x as usize);
        [
            canvas.pixels[idx],
            canvas.pixels[idx + 1],
            canvas.pixels[idx + 2],
            canvas.pixels[idx + 3],
        ]
    }

    fn marked_pixels(canvas: &ContactCanvas) -> usize {
        canvas
            .pixels
            .chunks_exact(4)
            .filter(|c| *c != [255, 255, 255, 255])
            .count()
    }

    #[test]
    fn layout_offsets_are_cumulative() {
        let graph = test_graph(&[3, 0, 7], &[]);
        let layout = layout_nodes(&graph);

        assert_eq!(layout.offsets.len(), 3);
        assert_eq!(layout.offsets[&0], 0);
        assert_eq!(layout.offsets[&1], 3);
        assert_eq!(layout.offsets[&2], 3);
        assert_eq!(layout.total_len, 10);
        assert_eq!(layout.offsets[&2] + graph.get_length(2), layout.total_len);
    }

    #[test]
    fn scale_requires_sequence() {
        assert_eq!(compute_scale(100, 10), Some(10.0));
        assert_eq!(compute_scale(1000, 0), None);
    }

    #[test]
    fn accumulate_darkens_and_saturates() {
        let mut canvas = ContactCanvas::new(10, 10, 1.0, 0.5);
        assert_eq!(canvas.v, 128);

        canvas.accumulate(2.0, 3.0);
        assert_eq!(px(&canvas, 2, 3), [127, 127, 127, 255]);

        canvas.accumulate(2.0, 3.0);
        assert_eq!(px(&canvas, 2, 3), [0, 0, 0, 255]);

        // further visits keep the pixel black, never wrapping
        canvas.accumulate(2.0, 3.0);
        assert_eq!(px(&canvas, 2, 3), [0, 0, 0, 255]);
    }

    #[test]
    fn accumulate_full_alpha_blacks_out_in_one_visit() {
        let mut canvas = ContactCanvas::new(4, 4, 1.0, 1.0);
        canvas.accumulate(1.0, 1.0);
        assert_eq!(px(&canvas, 1, 1), [0, 0, 0, 255]);
        assert_eq!(marked_pixels(&canvas), 1);
    }

    #[test]
    fn accumulate_clamps_to_canvas() {
        let mut canvas = ContactCanvas::new(10, 10, 1.0, 1.0);
        canvas.accumulate(1e12, 1e12);
        assert_eq!(px(&canvas, 9, 9), [0, 0, 0, 255]);

        // rounding overshoot at the edge clamps instead of going out of bounds
        canvas.accumulate(9.6, 0.0);
        assert_eq!(px(&canvas, 9, 0), [0, 0, 0, 255]);
        assert_eq!(marked_pixels(&canvas), 2);
    }

    #[test]
    fn node_pass_marks_baseline() {
        // one segment of length 10 on a 100x100 canvas: scale 10, one mark
        // every 10 pixels along y = 0
        let graph = test_graph(&[10], &[]);
        let layout = layout_nodes(&graph);
        let scale = compute_scale(100, layout.total_len).unwrap();
        assert_eq!(scale, 10.0);

        let mut canvas = ContactCanvas::new(100, 100, scale, 1.0);
        draw_nodes(&mut canvas, &graph, &layout);

        for k in 0..10 {
            assert_eq!(px(&canvas, k * 10, 0), [0, 0, 0, 255]);
        }
        assert_eq!(marked_pixels(&canvas), 10);
    }

    #[test]
    fn edge_pass_draws_staircase() {
        // two length-5 segments with one forward edge, width 50: positions 0
        // and 5, scale 5, so the staircase spans 25 pixels
        let graph = test_graph(&[5, 5], &[(0, 1)]);
        let layout = layout_nodes(&graph);
        let scale = compute_scale(50, layout.total_len).unwrap();
        assert_eq!(scale, 5.0);

        let mut canvas = ContactCanvas::new(50, 50, scale, 1.0);
        draw_edges(&mut canvas, &graph, &layout);

        for y in 0..25 {
            assert_eq!(px(&canvas, 0, y), [0, 0, 0, 255], "near stroke y={}", y);
            assert_eq!(px(&canvas, 25, y), [0, 0, 0, 255], "far stroke y={}", y);
        }
        for x in 0..25 {
            assert_eq!(px(&canvas, x, 25), [0, 0, 0, 255], "connecting run x={}", x);
        }
        assert_eq!(px(&canvas, 30, 30), [255, 255, 255, 255]);
    }

    #[test]
    fn edge_walk_terminates_when_scale_exceeds_one() {
        // sub-base pixel steps: two length-2 segments on a 1000px axis give
        // scale 250, so each walk takes 500 marks and must still finish
        let graph = test_graph(&[2, 2], &[(0, 1)]);
        let layout = layout_nodes(&graph);
        let scale = compute_scale(1000, layout.total_len).unwrap();
        assert_eq!(scale, 250.0);

        let mut canvas = ContactCanvas::new(1000, 1000, scale, 1.0);
        draw_edges(&mut canvas, &graph, &layout);

        assert_eq!(px(&canvas, 0, 0), [0, 0, 0, 255]);
        assert_eq!(px(&canvas, 0, 499), [0, 0, 0, 255]);
        assert_eq!(px(&canvas, 500, 499), [0, 0, 0, 255]);
    }

    #[test]
    fn zero_distance_edge_draws_nothing() {
        let mut canvas = ContactCanvas::new(10, 10, 1.0, 1.0);
        draw_edge(&mut canvas, 4, 4);
        assert_eq!(marked_pixels(&canvas), 0);
    }

    #[test]
    fn edge_key_normalizes_direction() {
        // an edge and its reverse complement share one canonical key
        assert_eq!(edge_key(5, false, 2, true), edge_key(2, false, 5, true));
        assert_ne!(edge_key(2, false, 5, false), edge_key(2, false, 5, true));
    }

    #[test]
    fn parse_gfa_collects_segments_and_edges() {
        let gfa = "H\tVN:Z:1.0\n\
                   S\t1\tACGT\n\
                   S\t2\tGG\n\
                   S\t3\tTTTT\n\
                   L\t1\t+\t2\t+\t0M\n\
                   P\tp1\t1+,2+\t*\n\
                   W\tsample\t1\tchr1\t0\t8\t>2>3\n";
        let path = std::env::temp_dir().join("gfacontact_parse_test.gfa");
        {
            let mut f = File::create(&path).unwrap();
            f.write_all(gfa.as_bytes()).unwrap();
        }

        let graph = parse_gfa(&path).unwrap();
        let _ = std::fs::remove_file(&path);

        assert_eq!(graph.node_count(), 3);
        assert_eq!(graph.get_length(0), 4);
        assert_eq!(graph.get_length(1), 2);
        assert_eq!(graph.get_length(2), 4);

        // the P-line repeats the L-line edge, so only two edges survive:
        // 1->2 and the walk's 2->3
        assert_eq!(graph.edges.len(), 2);
        assert_eq!(graph.follow_edges(0, false).collect::<Vec<_>>(), vec![1]);
        assert_eq!(graph.follow_edges(1, false).collect::<Vec<_>>(), vec![2]);
        assert_eq!(graph.follow_edges(1, true).collect::<Vec<_>>(), vec![0]);
        assert_eq!(graph.follow_edges(2, true).collect::<Vec<_>>(), vec![1]);
    }
}
