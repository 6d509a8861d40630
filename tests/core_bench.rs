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

use ndarray as nd;
use ndarray_rand::{rand_distr::Uniform, RandomExt};
use rayon::prelude::*;

use immersion_watershed::prelude::*;

#[test]
fn core_bench() {
  //Create a random uniform field
  let rf = nd::Array2::<u8>::random((512, 512), Uniform::new(0, 255));

  //Set-up the watershed transform
  let watershed = TransformBuilder::new().set_connectivity(8).build().unwrap();

  //Reference run on the current thread
  let start = std::time::Instant::now();
  let reference = watershed.transform(rf.view());
  println!("serial run took {:.03}s", start.elapsed().as_secs_f64());

  /*One call = one unit of work: the transform holds no shared state, so
    independent invocations may run on as many threads as we like with zero
    coordination. All of them must agree with the serial reference run.
  */
  let num_runs = rayon::current_num_threads().max(2);
  println!("running {num_runs} concurrent transforms");

  let start = std::time::Instant::now();
  let results: Vec<nd::Array2<usize>> =
    (0..num_runs).into_par_iter().map(|_| watershed.transform(rf.view())).collect();
  println!("{num_runs} concurrent runs took {:.03}s", start.elapsed().as_secs_f64());

  for (run, labels) in results.iter().enumerate() {
    assert_eq!(labels, &reference, "concurrent run {run} diverged from the serial run");
  }
}
