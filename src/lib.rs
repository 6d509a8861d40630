/*
  Copyright© 2023 Raúl Wolters(1)

  This file is part of immersion-watershed.

  immersion-watershed is free software: you can redistribute it and/or modify
  it under the terms of the European Union Public License version 1.2 or
  later, as published by the European Commission.

  immersion-watershed is distributed in the hope that it will be useful, but
  WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY
  or FITNESS FOR A PARTICULAR PURPOSE. See the European Union Public License
  for more details.

  You should have received a copy of the EUPL in an/all official language(s)
  of the European Union along with immersion-watershed.  If not, see
  <https://ec.europa.eu/info/european-union-public-licence_en/>.

  (1) Resident of the Kingdom of the Netherlands; agreement between licensor and
  licensee subject to Dutch law as per article 15 of the EUPL.
*/

//! Immersion-watershed is a pure-rust implementation of the classic watershed
//! transform by immersion simulation (see Vincent & Soille, 1991[^1]).
//!
//! # The algorithm
//! The watershed transform treats a scalar 2D raster (usually a gradient
//! magnitude image) as a topographic surface and simulates slowly raising a
//! water level over it. Pixels are processed in ascending order of their
//! height value; water first pools in the local minima of the surface and each
//! pool becomes a *catchment basin* with its own positive label. Wherever two
//! pools meet, a one-pixel *watershed line* is erected between them. The
//! result is a complete partition of the image into labelled basins separated
//! by `0`-valued boundary pixels.
//!
//! Unlike marker-controlled variants, this transform is *unmarked*: it
//! discovers its own minima while flooding. It is also fully deterministic;
//! ties between pixels of equal height are broken by the order in which the
//! pixels were extracted from the raster (row-major), so two runs on the same
//! input always produce bit-identical output.
//!
//! # Quickstart
//! To use the latest release of immersion-watershed in a cargo project, add
//! the crate as a dependency to your `Cargo.toml` file:
//! ```toml
//! [dependencies]
//! immersion-watershed = "0.1"
//! ```
//! The transform is configured with the commonly used "builder pattern". To
//! configure a transform, create an instance of the `TransformBuilder` struct.
//! Once you are done specifying options using its associated functions, call
//! the `build()` function to obtain a (`Sync`&`Send`) `ImmersionWatershed`
//! object, which you can now use to flood as many rasters as you like.
//!
//! ## Short example: flooding a random field
//! ```rust
//! use immersion_watershed::prelude::*;
//! use ndarray_rand::{rand_distr::Uniform, RandomExt};
//!
//! //Create a random uniform field
//! let rf = ndarray::Array2::<u8>::random((512, 512), Uniform::new(0, 255));
//! //Set-up the watershed transform (8-connectivity, full height range)
//! let watershed = TransformBuilder::new().set_connectivity(8).build().unwrap();
//! //Execute the watershed transform
//! let labels = watershed.transform(rf.view());
//! ```
//! [^1]: L. Vincent and P. Soille. **Watersheds in digital spaces: an
//! efficient algorithm based on immersion simulations.** *IEEE Transactions on
//! Pattern Analysis and Machine Intelligence*, 13(6):583–598, June 1991.
//!
//! # Cargo feature gates
//! *By default, all features behind cargo feature gates are **disabled***
//! - `jemalloc`: this feature enables the [jemalloc allocator](https://jemalloc.net).
//! Jemalloc is enabled through usage of the `jemallocator` crate, which
//! increases compile times considerably but can improve run-time performance.
//! To compile `immersion-watershed` with the `jemalloc` feature, jemalloc must
//! be installed on the host system.
//! - `progress`: this feature enables a progress bar for the watershed
//! transform, advanced each time a height level has been fully flooded.
//! Enabling this feature adds the `indicatif` crate as a dependency.
//! - `debug`: this feature enables performance monitoring output. This can
//! negatively impact performance. Enabling this feature does not add
//! additional dependencies.
//!
//! Progress and performance output are side channels only: enabling or
//! disabling them never changes the computed labels.

//Unconditional imports
use std::collections::VecDeque;

use ndarray as nd;
use num_traits::ToPrimitive;
use rayon::prelude::*;

//Set Jemalloc as the global allocator for this crate
#[cfg(feature = "jemalloc")]
#[global_allocator]
static GLOBAL: jemallocator::Jemalloc = jemallocator::Jemalloc;

//Progress bar (conditional)
#[cfg(feature = "progress")]
use indicatif;

/// Numeric code of watershed lines in the output raster. Pixels that were
/// excluded from the flood by the configured height range share this code.
pub const WATERSHED_LINE: usize = 0;

//Utility prelude for batch import
pub mod prelude {
  pub use crate::{
    ConfigError, Connectivity, ImmersionWatershed, Label, LabelGrid, TransformBuilder,
    WATERSHED_LINE,
  };
}

////////////////////////////////////////////////////////////////////////////////
//                              HELPER FUNCTIONS                              //
////////////////////////////////////////////////////////////////////////////////

#[cfg(feature = "progress")]
fn set_up_bar(num_px: u64) -> indicatif::ProgressBar {
  const TEMPLATE: &str = "{spinner}[{elapsed}/{duration}] flooded {pos}/{len} px{bar:60}";
  let style = indicatif::ProgressStyle::with_template(TEMPLATE);
  let bar = indicatif::ProgressBar::new(num_px);
  bar.set_style(style.unwrap());
  return bar;
}

//Neighbour offsets, in inspection order
const OFFSETS_4CON: [(isize, isize); 4] = [(1, 0), (0, 1), (0, -1), (-1, 0)];
const OFFSETS_8CON: [(isize, isize); 8] =
  [(1, 0), (1, 1), (1, -1), (0, 1), (0, -1), (-1, 0), (-1, 1), (-1, -1)];

#[inline]
fn in_bounds(index: (isize, isize), shape: (usize, usize)) -> Option<(usize, usize)> {
  let (x, y) = index;
  if x < 0 || y < 0 || x >= shape.0 as isize || y >= shape.1 as isize {
    None
  } else {
    Some((x as usize, y as usize))
  }
}

/// returns the (min, max) of all finite pixel values, or `None` if the raster
/// contains no finite pixels at all
fn value_range<T>(img: nd::ArrayView2<T>) -> Option<(f64, f64)>
where
  T: ToPrimitive + Copy + Sync,
{
  img
    .into_par_iter()
    .filter_map(|px| px.to_f64().filter(|val| val.is_finite()))
    .map(|val| (val, val))
    .reduce_with(|(min_a, max_a), (min_b, max_b)| (min_a.min(min_b), max_a.max(max_b)))
}

////////////////////////////////////////////////////////////////////////////////
//                             OPTIONAL MODULES                               //
////////////////////////////////////////////////////////////////////////////////
#[cfg(feature = "debug")]
mod performance_monitoring {

  #[derive(Clone, Debug, Default)]
  pub struct PerfReport {
    pub extract_ms: usize,
    pub sort_ms: usize,
    pub level_mus: Vec<usize>,
    pub total_ms: usize,
  }

  impl PerfReport {
    pub fn level_avg(&self) -> f64 {
      let num = self.level_mus.len() as f64;
      self.level_mus.iter().map(|&x| x as f64).sum::<f64>() / num
    }
    pub fn level_total(&self) -> f64 {
      self.level_mus.iter().map(|&x| x as f64).sum()
    }
  }

  impl std::fmt::Display for PerfReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      writeln!(f, ">---------[Performance Summary]---------")?;
      writeln!(f, ">  Flooded {} height levels", self.level_mus.len())?;
      writeln!(f, ">  Extraction: {}ms; Sort: {}ms", self.extract_ms, self.sort_ms)?;
      writeln!(
        f,
        ">  Level Average: {:.1}µs; Σ {:.0}µs",
        self.level_avg(),
        self.level_total()
      )?;
      writeln!(f, ">--------------------------------+ total")?;
      writeln!(
        f,
        ">  {}ms with {:.1}ms overhead (Δt)",
        self.total_ms,
        self.total_ms as f64
          - self.extract_ms as f64
          - self.sort_ms as f64
          - self.level_total() / 1000.0
      )
    }
  }
}

////////////////////////////////////////////////////////////////////////////////
//                         CONFIGURATION & ERRORS                             //
////////////////////////////////////////////////////////////////////////////////

/// Error returned when a `TransformBuilder` was configured with invalid
/// parameters. Configuration errors always surface from `build()`, before any
/// pixel has been touched; a successfully built transform cannot fail.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
  #[error("unsupported connectivity {0} (must be 4 or 8)")]
  UnsupportedConnectivity(u8),
  #[error("invalid height range: minimum {min} exceeds maximum {max}")]
  InvalidHeightRange { min: f64, max: f64 },
}

/// Pixel adjacency used while flooding.
///
/// The two variants are interchangeable strategies: `Four` considers only the
/// axis-aligned neighbours of a pixel, `Eight` also considers the diagonal
/// ones. The variant is selected once per transform (via
/// `TransformBuilder::set_connectivity`) and never changes mid-run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
  Four,
  Eight,
}

impl Connectivity {
  /// Candidate neighbour coordinates of `index`, in fixed inspection order,
  /// *without* bounds checking or allocation. Coordinates may lie outside the
  /// raster; callers must discard those.
  #[inline]
  fn neighbours(self, index: (usize, usize)) -> impl Iterator<Item = (isize, isize)> {
    let (x, y): (isize, isize) = (index.0 as isize, index.1 as isize);
    let offsets: &'static [(isize, isize)] = match self {
      Connectivity::Four => &OFFSETS_4CON,
      Connectivity::Eight => &OFFSETS_8CON,
    };
    offsets.iter().map(move |&(dx, dy)| (x + dx, y + dy))
  }
}

impl TryFrom<u8> for Connectivity {
  type Error = ConfigError;

  fn try_from(raw: u8) -> Result<Self, ConfigError> {
    match raw {
      4 => Ok(Connectivity::Four),
      8 => Ok(Connectivity::Eight),
      other => Err(ConfigError::UnsupportedConnectivity(other)),
    }
  }
}

#[derive(Debug, Clone)]
/// Builder for configuring a watershed transform.
///
/// Use `new()` to start configuring a transform with the default settings
/// (4-connectivity, height range taken from the raster itself). Once you have
/// set the desired options, an `ImmersionWatershed` object can be generated
/// with the `build()` associated function. `build()` returns an `Err` result
/// if the configuration is invalid, see [`ConfigError`].
pub struct TransformBuilder {
  connectivity: u8,
  height_range: Option<(f64, f64)>,
}

impl Default for TransformBuilder {
  fn default() -> Self {
    Self::new()
  }
}

impl TransformBuilder {
  /// creates a new `TransformBuilder` with default settings
  pub fn new() -> Self {
    TransformBuilder { connectivity: 4, height_range: None }
  }

  /// Set the pixel connectivity of the transform. Only `4` and `8` are valid;
  /// any other value makes `build()` fail.
  pub fn set_connectivity(mut self, connectivity: u8) -> Self {
    self.connectivity = connectivity;
    self
  }

  /// Set the inclusive height interval of pixels that take part in the flood.
  /// Pixels outside `[h_min, h_max]` are never visited and end up with the
  /// `WATERSHED_LINE` code in the output. If no range is set, the actual
  /// minimum and maximum of each input raster are used.
  pub fn set_height_range(mut self, h_min: f64, h_max: f64) -> Self {
    self.height_range = Some((h_min, h_max));
    self
  }

  /// Build an `ImmersionWatershed` from the current builder configuration.
  /// This function returns an `Err` result if the builder was not properly
  /// configured.
  pub fn build(self) -> Result<ImmersionWatershed, ConfigError> {
    let connectivity = Connectivity::try_from(self.connectivity)?;
    if let Some((min, max)) = self.height_range {
      if min > max {
        return Err(ConfigError::InvalidHeightRange { min, max });
      }
    }
    Ok(ImmersionWatershed { connectivity, height_range: self.height_range })
  }
}

////////////////////////////////////////////////////////////////////////////////
//                          LABELS & LABEL GRID                               //
////////////////////////////////////////////////////////////////////////////////

/// State of a single pixel during (and after) the flood.
///
/// These replace the sentinel integers (`INIT`, `MASK`, `INQUEUE`, `WSHED`)
/// that immersion-simulation implementations traditionally encode into the
/// label image itself. `Masked` and `Enqueued` are transient: once a transform
/// has run to completion, every cell holds `Unvisited`, `Boundary` or
/// `Basin(_)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Label {
  /// never reached by the flood (height outside the configured range)
  Unvisited,
  /// part of the height level currently being flooded, not yet classified
  Masked,
  /// waiting in the FIFO for neighbour inspection
  Enqueued,
  /// watershed line between two or more catchment basins
  Boundary,
  /// member of the catchment basin with this id; ids start at 1 and increase
  /// in the order the minima were discovered
  Basin(usize),
}

/// Dense 2D grid of per-pixel labels, the sole output of a watershed flood.
///
/// A `LabelGrid` has the same shape as the raster it was computed from. It is
/// exclusively owned by the transform while the flood runs and handed to the
/// caller by value afterwards; nothing mutates it once it has been returned.
#[derive(Debug, Clone, PartialEq)]
pub struct LabelGrid {
  cells: nd::Array2<Label>,
}

impl LabelGrid {
  fn new(shape: (usize, usize)) -> Self {
    LabelGrid { cells: nd::Array2::from_elem(shape, Label::Unvisited) }
  }

  #[inline]
  fn get(&self, index: (usize, usize)) -> Label {
    self.cells[index]
  }

  #[inline]
  fn set(&mut self, index: (usize, usize), label: Label) {
    self.cells[index] = label;
  }

  /// read-only view of the label cells
  pub fn view(&self) -> nd::ArrayView2<Label> {
    self.cells.view()
  }

  /// dimensions of the grid (rows, columns)
  pub fn dim(&self) -> (usize, usize) {
    self.cells.dim()
  }

  /// Convert the grid to the externally visible raster: `Basin(id)` maps to
  /// `id`, everything else (watershed lines and pixels the flood never
  /// reached) maps to [`WATERSHED_LINE`]. Basin ids are kept as-is, with no
  /// renumbering or compaction.
  ///
  /// This is a pure function of the grid; converting the same grid twice
  /// yields identical rasters.
  pub fn to_raster(&self) -> nd::Array2<usize> {
    nd::Zip::from(&self.cells).par_map_collect(|cell| match cell {
      Label::Basin(id) => *id,
      _ => WATERSHED_LINE,
    })
  }
}

////////////////////////////////////////////////////////////////////////////////
//                        PIXEL EXTRACTION & ORDERING                         //
////////////////////////////////////////////////////////////////////////////////

/// A pixel that takes part in the flood: its raster index, its height and the
/// sequence number it was assigned during extraction. Sequence numbers are
/// strictly increasing in row-major scan order and break ties between pixels
/// of equal height, which makes the processing order (and hence the entire
/// transform) deterministic.
#[derive(Debug, Clone, Copy, PartialEq)]
struct PixelSample {
  index: (usize, usize),
  height: f64,
  sequence: usize,
}

impl PixelSample {
  /// ascending height, ties broken by extraction order
  #[inline]
  fn flood_order(&self, other: &Self) -> std::cmp::Ordering {
    self.height.total_cmp(&other.height).then(self.sequence.cmp(&other.sequence))
  }
}

/// Extract all pixels whose height is finite and inside `[h_min, h_max]`,
/// in row-major order, tagging each with its extraction sequence number.
fn extract_samples<T>(img: nd::ArrayView2<T>, h_min: f64, h_max: f64) -> Vec<PixelSample>
where
  T: ToPrimitive + Copy,
{
  let mut samples = Vec::with_capacity(img.len());
  let mut sequence = 0;
  for (index, px) in img.indexed_iter() {
    if let Some(height) = px.to_f64().filter(|val| val.is_finite()) {
      if height >= h_min && height <= h_max {
        samples.push(PixelSample { index, height, sequence });
        sequence += 1;
      }
    }
  }
  samples
}

////////////////////////////////////////////////////////////////////////////////
//                          WATERSHED TRANSFORM                               //
////////////////////////////////////////////////////////////////////////////////

/// Implementation of the watershed transform by immersion simulation.
///
/// See crate-level documentation for a general introduction to the algorithm.
///
/// An `ImmersionWatershed` is obtained from a [`TransformBuilder`] and holds
/// only plain configuration data, so it is `Send` and `Sync` and can be shared
/// freely between threads. Every call to `flood` or `transform` allocates its
/// own working state (label grid, FIFO, sample list), so independent
/// invocations may run in parallel with zero coordination.
///
/// # Algorithm
/// The flood processes the in-range pixels of the raster in ascending height
/// order, one *level* (maximal run of equal-height pixels) at a time. Each
/// level goes through three phases:
/// 1. every pixel of the level is masked, and pixels bordering an already
/// labelled region are pushed onto a FIFO;
/// 2. the FIFO is drained, growing the existing basins into the level and
/// erecting watershed lines where two different basins meet;
/// 3. pixels of the level that no existing basin could reach are the seeds of
/// new local minima: each connected component of them becomes a fresh basin.
///
/// # Memory usage
/// The transform allocates a label grid of the same shape as the input plus a
/// sample vector holding every in-range pixel, so one can count on the memory
/// usage being a small constant multiple of the input size.
///
/// # Output
/// - `flood` returns the completed [`LabelGrid`], which retains the full
/// per-pixel label states.
/// - `transform` returns the conventional `Array2<usize>` raster in which `0`
/// marks watershed lines (and unreached pixels) and `1..=N` identify basins.
#[derive(Debug, Clone)]
pub struct ImmersionWatershed {
  connectivity: Connectivity,
  height_range: Option<(f64, f64)>,
}

impl ImmersionWatershed {
  /// the connectivity this transform floods with
  pub fn connectivity(&self) -> Connectivity {
    self.connectivity
  }

  /// Returns the watershed transform of the input raster as a label raster:
  /// `0` for watershed lines and unreached pixels, `1..=N` for basins.
  pub fn transform<T>(&self, input: nd::ArrayView2<T>) -> nd::Array2<usize>
  where
    T: ToPrimitive + Copy + Sync,
  {
    self.flood(input).to_raster()
  }

  /// Runs the immersion simulation and returns the completed label grid.
  pub fn flood<T>(&self, input: nd::ArrayView2<T>) -> LabelGrid
  where
    T: ToPrimitive + Copy + Sync,
  {
    let shape = input.dim();
    let mut grid = LabelGrid::new(shape);

    //(logging) make a new perfreport
    #[cfg(feature = "debug")]
    let mut perf = crate::performance_monitoring::PerfReport::default();
    #[cfg(feature = "debug")]
    let flood_start = std::time::Instant::now();

    //(1) resolve the height interval: configured range, or the actual range
    //of the raster
    let (h_min, h_max) = match self.height_range {
      Some(range) => range,
      None => match value_range(input.view()) {
        Some(range) => range,
        //No finite pixels at all (this includes the empty raster)
        None => return grid,
      },
    };

    //(2) extract the in-range pixels and sort them into flooding order.
    //The sort may be unstable: equal-height samples are already totally
    //ordered by their sequence numbers.
    #[cfg(feature = "debug")]
    let extract_start = std::time::Instant::now();
    let mut samples = extract_samples(input.view(), h_min, h_max);
    #[cfg(feature = "debug")]
    {
      perf.extract_ms = extract_start.elapsed().as_millis() as usize;
    }

    #[cfg(feature = "debug")]
    let sort_start = std::time::Instant::now();
    samples.sort_unstable_by(|a, b| a.flood_order(b));
    #[cfg(feature = "debug")]
    {
      perf.sort_ms = sort_start.elapsed().as_millis() as usize;
    }

    log::debug!(
      "flooding {} of {} pixels ({:?}-connectivity, heights {h_min}..={h_max})",
      samples.len(),
      input.len(),
      self.connectivity
    );

    //(3) set-up progress bar
    #[cfg(feature = "progress")]
    let bar = set_up_bar(samples.len() as u64);

    //(4) flood the raster level by level
    let mut fifo: VecDeque<(usize, usize)> = VecDeque::new();
    //incremented before first use, so basin ids start at 1
    let mut next_basin = WATERSHED_LINE;
    let mut level_start = 0;

    while level_start < samples.len() {
      #[cfg(feature = "debug")]
      let level_timer = std::time::Instant::now();

      //A level is a maximal run of consecutive sorted samples that share the
      //same height value
      let height = samples[level_start].height;
      let level_end = level_start
        + samples[level_start..].iter().take_while(|sample| sample.height == height).count();
      let level = &samples[level_start..level_end];

      /*(i) Mask phase
        Every pixel of this level becomes MASKED. Pixels that border a region
        labelled during a previous level (a basin or a watershed line) are the
        entry points for the rising water: they go onto the FIFO as ENQUEUED.
        Each pixel is enqueued at most once here.
      */
      for sample in level {
        grid.set(sample.index, Label::Masked);
        let borders_labelled = self
          .connectivity
          .neighbours(sample.index)
          .filter_map(|neigh| in_bounds(neigh, shape))
          .any(|neigh| matches!(grid.get(neigh), Label::Basin(_) | Label::Boundary));
        if borders_labelled {
          grid.set(sample.index, Label::Enqueued);
          fifo.push_back(sample.index);
        }
      }

      /*(ii) Propagation phase
        Drain the FIFO, growing the existing basins into this level. A pixel
        touching exactly one basin joins it; a pixel touching two different
        basins becomes a watershed line. The plateau flag lets a plateau that
        touches an existing watershed line keep extending that line instead of
        being claimed by a basin; it is local state of this phase, reset at
        every level.
      */
      let mut on_boundary_plateau = false;
      while let Some(px) = fifo.pop_front() {
        for neigh in self.connectivity.neighbours(px).filter_map(|neigh| in_bounds(neigh, shape)) {
          match grid.get(neigh) {
            Label::Basin(id) => match grid.get(px) {
              Label::Enqueued => grid.set(px, Label::Basin(id)),
              Label::Boundary if on_boundary_plateau => grid.set(px, Label::Basin(id)),
              Label::Basin(own) if own != id => {
                //this pixel is touched by two different basins
                grid.set(px, Label::Boundary);
                on_boundary_plateau = false;
              }
              _ => (),
            },
            Label::Boundary => {
              if grid.get(px) == Label::Enqueued {
                grid.set(px, Label::Boundary);
                on_boundary_plateau = true;
              }
            }
            Label::Masked => {
              //connected to the flooding front, inspect it too
              grid.set(neigh, Label::Enqueued);
              fifo.push_back(neigh);
            }
            _ => (),
          }
        }
      }

      /*(iii) New-minimum phase
        Pixels of this level that are still MASKED were not reachable from any
        existing basin: they are genuine new local minima. Each connected
        component of them gets the next basin id, assigned with a plain
        breadth-first fill so that a flat minimum receives one consistent
        label.
      */
      for sample in level {
        if grid.get(sample.index) != Label::Masked {
          continue;
        }
        next_basin += 1;
        grid.set(sample.index, Label::Basin(next_basin));
        fifo.push_back(sample.index);
        while let Some(px) = fifo.pop_front() {
          for neigh in self.connectivity.neighbours(px).filter_map(|neigh| in_bounds(neigh, shape))
          {
            if grid.get(neigh) == Label::Masked {
              grid.set(neigh, Label::Basin(next_basin));
              fifo.push_back(neigh);
            }
          }
        }
      }

      #[cfg(feature = "debug")]
      perf.level_mus.push(level_timer.elapsed().as_micros() as usize);

      //(v) Update progressbar
      #[cfg(feature = "progress")]
      {
        bar.inc(level.len() as u64);
      }

      level_start = level_end;
    }

    log::debug!("watershed transform finished with {next_basin} basins");

    //(5) print performance report
    #[cfg(feature = "debug")]
    {
      perf.total_ms = flood_start.elapsed().as_millis() as usize;
      println!("{perf}");
    }

    //Return the completed label grid
    return grid;
  }
}
