//! Image, component and tile-grid geometry on the JPEG 2000 canvas.

use crate::error::{CodecError, Result};
use crate::geometry::{ceil_div, Rect};

/// Upper bound on components imposed by the SIZ marker (Csiz).
pub const MAX_COMPONENTS: u16 = 16384;
/// Total tiles in the grid may not exceed 65535.
pub const MAX_TILES: u32 = 65535;
/// Component precision bound (CBD can raise precision up to 38).
pub const MAX_PRECISION: u8 = 38;

/// One image component: sub-sampling, precision and, once decoded, the
/// sample plane covering the component grid.
#[derive(Debug, Clone, Default)]
pub struct J2kComponent {
    /// Horizontal sub-sampling (XRsiz), 1..=255.
    pub dx: u32,
    /// Vertical sub-sampling (YRsiz).
    pub dy: u32,
    /// Bit precision, 1..=38.
    pub prec: u8,
    /// Signed samples.
    pub sgnd: bool,
    /// Horizontal registration offset (CRG marker).
    pub crg_x: u16,
    /// Vertical registration offset (CRG marker).
    pub crg_y: u16,
    /// Component grid rectangle: canvas divided by sub-sampling.
    pub rect: Rect,
    /// Decoded sample plane, row-major over `rect`, empty until the
    /// component has been decoded.
    pub data: Vec<i32>,
}

impl J2kComponent {
    pub fn width(&self) -> u32 {
        self.rect.width()
    }

    pub fn height(&self) -> u32 {
        self.rect.height()
    }

    /// Allocate (or re-use) the sample plane.
    pub fn alloc_data(&mut self) -> Result<()> {
        let n = self.rect.area();
        if n > u32::MAX as u64 {
            return Err(CodecError::AllocationFailure(format!(
                "component plane of {n} samples"
            )));
        }
        self.data.clear();
        self.data.resize(n as usize, 0);
        Ok(())
    }
}

/// The decoded image: canvas origin/extent, tile grid and components.
#[derive(Debug, Clone, Default)]
pub struct J2kImage {
    /// Canvas origin (XOsiz, YOsiz).
    pub x0: u32,
    pub y0: u32,
    /// Canvas extent (Xsiz, Ysiz).
    pub x1: u32,
    pub y1: u32,
    /// Tile grid origin (XTOsiz, YTOsiz).
    pub tx0: u32,
    pub ty0: u32,
    /// Tile size (XTsiz, YTsiz).
    pub tdx: u32,
    pub tdy: u32,
    pub comps: Vec<J2kComponent>,
}

impl J2kImage {
    /// Tile grid width: `ceil((x1 - tx0) / tdx)`.
    pub fn t_grid_w(&self) -> u32 {
        ceil_div(self.x1 - self.tx0, self.tdx)
    }

    /// Tile grid height: `ceil((y1 - ty0) / tdy)`.
    pub fn t_grid_h(&self) -> u32 {
        ceil_div(self.y1 - self.ty0, self.tdy)
    }

    pub fn num_tiles(&self) -> u32 {
        self.t_grid_w() * self.t_grid_h()
    }

    /// Canvas rectangle of tile `tile_index`, clipped to the image area.
    pub fn tile_rect(&self, tile_index: u16) -> Rect {
        let tw = self.t_grid_w();
        let p = tile_index as u32 % tw;
        let q = tile_index as u32 / tw;
        let tx0 = (self.tx0 + p * self.tdx).max(self.x0);
        let ty0 = (self.ty0 + q * self.tdy).max(self.y0);
        let tx1 = (self.tx0 + (p + 1) * self.tdx).min(self.x1);
        let ty1 = (self.ty0 + (q + 1) * self.tdy).min(self.y1);
        Rect::new(tx0, ty0, tx1, ty1)
    }

    /// Tile rectangle on a component grid (canvas / sub-sampling).
    pub fn tile_comp_rect(&self, tile_index: u16, compno: usize) -> Rect {
        let t = self.tile_rect(tile_index);
        let c = &self.comps[compno];
        Rect::new(
            ceil_div(t.x0, c.dx),
            ceil_div(t.y0, c.dy),
            ceil_div(t.x1, c.dx),
            ceil_div(t.y1, c.dy),
        )
    }

    /// Validate SIZ-derived geometry (spec invariants on the data model).
    pub fn validate(&self) -> Result<()> {
        if self.x1 <= self.x0 || self.y1 <= self.y0 {
            return Err(CodecError::ParameterOutOfRange(format!(
                "degenerate canvas ({},{})..({},{})",
                self.x0, self.y0, self.x1, self.y1
            )));
        }
        if self.tdx == 0 || self.tdy == 0 {
            return Err(CodecError::ParameterOutOfRange(
                "tile dimensions must be positive".into(),
            ));
        }
        if self.tx0 > self.x0 || self.ty0 > self.y0 {
            return Err(CodecError::ParameterOutOfRange(
                "tile grid origin must not exceed image origin".into(),
            ));
        }
        if self.comps.is_empty() || self.comps.len() > MAX_COMPONENTS as usize {
            return Err(CodecError::ParameterOutOfRange(format!(
                "component count {} outside 1..={}",
                self.comps.len(),
                MAX_COMPONENTS
            )));
        }
        if self.num_tiles() > MAX_TILES {
            return Err(CodecError::ParameterOutOfRange(format!(
                "{} tiles exceed the maximum of {}",
                self.num_tiles(),
                MAX_TILES
            )));
        }
        for (i, c) in self.comps.iter().enumerate() {
            if c.dx == 0 || c.dx > 255 || c.dy == 0 || c.dy > 255 {
                return Err(CodecError::ParameterOutOfRange(format!(
                    "component {i} sub-sampling ({},{})",
                    c.dx, c.dy
                )));
            }
            if c.prec == 0 || c.prec > MAX_PRECISION {
                return Err(CodecError::ParameterOutOfRange(format!(
                    "component {i} precision {}",
                    c.prec
                )));
            }
        }
        Ok(())
    }

    /// Derive each component's grid rectangle from the canvas.
    pub fn update_component_rects(&mut self) {
        let (x0, y0, x1, y1) = (self.x0, self.y0, self.x1, self.y1);
        for c in &mut self.comps {
            c.rect = Rect::new(
                ceil_div(x0, c.dx),
                ceil_div(y0, c.dy),
                ceil_div(x1, c.dx),
                ceil_div(y1, c.dy),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn simple_image(w: u32, h: u32, tdx: u32, tdy: u32) -> J2kImage {
        let mut img = J2kImage {
            x1: w,
            y1: h,
            tdx,
            tdy,
            comps: vec![J2kComponent {
                dx: 1,
                dy: 1,
                prec: 8,
                ..Default::default()
            }],
            ..Default::default()
        };
        img.update_component_rects();
        img
    }

    #[test]
    fn tile_grid_dimensions() {
        let img = simple_image(100, 60, 32, 32);
        assert_eq!(img.t_grid_w(), 4);
        assert_eq!(img.t_grid_h(), 2);
        assert_eq!(img.num_tiles(), 8);
    }

    #[test]
    fn edge_tiles_are_clipped() {
        let img = simple_image(100, 60, 32, 32);
        assert_eq!(img.tile_rect(0), Rect::new(0, 0, 32, 32));
        assert_eq!(img.tile_rect(3), Rect::new(96, 0, 100, 32));
        assert_eq!(img.tile_rect(7), Rect::new(96, 32, 100, 60));
    }

    #[test]
    fn subsampled_component_rect() {
        let mut img = simple_image(101, 60, 101, 60);
        img.comps[0].dx = 2;
        img.update_component_rects();
        assert_eq!(img.comps[0].width(), 51);
        assert_eq!(img.tile_comp_rect(0, 0), Rect::new(0, 0, 51, 60));
    }

    #[test]
    fn validate_rejects_degenerate_canvas() {
        let mut img = simple_image(10, 10, 16, 16);
        img.x0 = 10;
        assert!(img.validate().is_err());
    }
}
