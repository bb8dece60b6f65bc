// Built-in integrands
//
// Three classic 2-D optimisation test functions, selected by number on the
// command line. Each has a GLSL kernel in shaders/ (compiled to
// func<N>.comp.spv) and a host evaluation used by the emulated device.

use std::path::{Path, PathBuf};

use crate::backend::HostKernel;
use crate::error::{Error, Result};
use crate::integrator::IntegralParams;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Integrand {
    /// De Jong's fifth function (Shekel's foxholes)
    DeJong,
    Ackley,
    Langermann,
}

const LANGERMANN_C: [f64; 5] = [1.0, 2.0, 5.0, 2.0, 3.0];
const LANGERMANN_A: [[f64; 2]; 5] = [[3.0, 5.0], [5.0, 2.0], [2.0, 1.0], [1.0, 4.0], [7.0, 9.0]];

impl Integrand {
    pub fn from_index(index: u32) -> Result<Self> {
        match index {
            1 => Ok(Integrand::DeJong),
            2 => Ok(Integrand::Ackley),
            3 => Ok(Integrand::Langermann),
            other => Err(Error::UnknownIntegrand(other)),
        }
    }

    pub fn index(self) -> u32 {
        match self {
            Integrand::DeJong => 1,
            Integrand::Ackley => 2,
            Integrand::Langermann => 3,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Integrand::DeJong => "De Jong's fifth function",
            Integrand::Ackley => "Ackley function",
            Integrand::Langermann => "Langermann function",
        }
    }

    pub fn kernel_path(self, shader_dir: &Path) -> PathBuf {
        shader_dir.join(format!("func{}.comp.spv", self.index()))
    }

    pub fn evaluate(self, x: f64, y: f64) -> f64 {
        match self {
            Integrand::DeJong => {
                let mut sum = 0.002;
                for i in -2..=2 {
                    for j in -2..=2 {
                        let k = f64::from(5 * (i + 2) + j + 3);
                        let a1 = 16.0 * f64::from(j);
                        let a2 = 16.0 * f64::from(i);
                        sum += 1.0 / (k + (x - a1).powi(6) + (y - a2).powi(6));
                    }
                }
                1.0 / sum
            }
            Integrand::Ackley => {
                use std::f64::consts::{E, PI};
                -20.0 * (-0.2 * (0.5 * (x * x + y * y)).sqrt()).exp()
                    - (0.5 * ((2.0 * PI * x).cos() + (2.0 * PI * y).cos())).exp()
                    + E
                    + 20.0
            }
            Integrand::Langermann => {
                use std::f64::consts::PI;
                LANGERMANN_C
                    .iter()
                    .zip(LANGERMANN_A.iter())
                    .map(|(c, a)| {
                        let r = (x - a[0]).powi(2) + (y - a[1]).powi(2);
                        c * (-r / PI).exp() * (PI * r).cos()
                    })
                    .sum()
            }
        }
    }

    pub fn host_kernel(self) -> HostKernel {
        grid_kernel(move |x, y| self.evaluate(x, y))
    }
}

/// Host version of the integration kernels.
///
/// Work group (gx, gy) sums `f` at the midpoints of every cell (i, j) with
/// i = gx mod groups_x and j = gy mod groups_y, and stores the partial sum as
/// an f64 at index gy * groups_x + gx of the storage buffer.
pub fn grid_kernel<F>(f: F) -> HostKernel
where
    F: Fn(f64, f64) -> f64 + 'static,
{
    Box::new(move |push, groups, storage| {
        let size = std::mem::size_of::<IntegralParams>();
        if push.len() < size {
            log::warn!("Integration kernel needs a {} byte parameter block", size);
            return;
        }
        let params: IntegralParams = bytemuck::pod_read_unaligned(&push[..size]);

        let splits_x = params.splits_x as u64;
        let splits_y = params.splits_y as u64;
        let dx = (params.end_x - params.start_x) / params.splits_x;
        let dy = (params.end_y - params.start_y) / params.splits_y;
        let (groups_x, groups_y) = (u64::from(groups[0]), u64::from(groups[1]));

        for gy in 0..groups_y {
            for gx in 0..groups_x {
                let mut sum = 0.0;
                for j in (gy..splits_y).step_by(groups_y as usize) {
                    let y = params.start_y + (j as f64 + 0.5) * dy;
                    for i in (gx..splits_x).step_by(groups_x as usize) {
                        sum += f(params.start_x + (i as f64 + 0.5) * dx, y);
                    }
                }

                let offset = (gy * groups_x + gx) as usize * std::mem::size_of::<f64>();
                if let Some(slot) = storage.get_mut(offset..offset + std::mem::size_of::<f64>()) {
                    slot.copy_from_slice(&sum.to_ne_bytes());
                }
            }
        }
    })
}
