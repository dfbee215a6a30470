//! The commands the viewer submits every frame.

use glam::{Vec2, Vec4};
use vkproc_core::command::{Clear, Pixels, TextureCreate, TextureFlags, TextureFormat};
use vkproc_core::state::Vertex;
use vkproc_core::{Command, PrimType, RenderState};

const CHECKER_SLOT: usize = 0;
const CHECKER_SIZE: u32 = 64;

/// A spinning textured quad over a coloured triangle.
#[derive(Debug, Default)]
pub struct Scene {
    texture_created: bool,
}

impl Scene {
    pub fn new() -> Self {
        Self::default()
    }

    /// Commands of one frame, without the trailing swap.
    pub fn frame_commands(&mut self, time: f32, width: u32, height: u32) -> anyhow::Result<Vec<Command>> {
        let mut commands = Vec::with_capacity(4);
        if !self.texture_created {
            commands.push(Command::TextureCreate(TextureCreate {
                slot: CHECKER_SLOT,
                pixels: checkerboard(CHECKER_SIZE)?,
                flags: TextureFlags::empty(),
            }));
            self.texture_created = true;
        }

        let pulse = 0.5 + 0.5 * (time * 0.5).sin();
        commands.push(Command::Clear(Clear {
            color: Vec4::new(0.05, 0.05 + 0.1 * pulse, 0.15, 1.0),
            force_clear: false,
        }));

        let size = Vec2::new(width as f32, height as f32);
        let screen = RenderState::new(Vec2::ZERO, size);
        let center = size * 0.5;
        let extent = size.min_element() * 0.35;

        let triangle = vec![
            Vertex::new(center + Vec2::new(0.0, -extent), Vec2::ZERO, [255, 64, 64, 255]),
            Vertex::new(center + Vec2::new(extent, extent), Vec2::ZERO, [64, 255, 64, 255]),
            Vertex::new(center + Vec2::new(-extent, extent), Vec2::ZERO, [64, 64, 255, 255]),
        ];
        commands.push(Command::render(screen, PrimType::Triangles, 1, triangle)?);

        let quad = rotated_quad(center, extent * 0.5, time, [255, 255, 255, 200]);
        commands.push(Command::render(
            screen.with_texture(CHECKER_SLOT),
            PrimType::Quads,
            1,
            quad.to_vec(),
        )?);
        Ok(commands)
    }
}

/// Corners of a square in quad index order: top-left, top-right, bottom-right, bottom-left.
pub fn rotated_quad(center: Vec2, half_extent: f32, angle: f32, color: [u8; 4]) -> [Vertex; 4] {
    let rotation = Vec2::from_angle(angle);
    let corner = |offset: Vec2, tex: Vec2| Vertex::new(center + rotation.rotate(offset * half_extent), tex, color);
    [
        corner(Vec2::new(-1.0, -1.0), Vec2::new(0.0, 0.0)),
        corner(Vec2::new(1.0, -1.0), Vec2::new(1.0, 0.0)),
        corner(Vec2::new(1.0, 1.0), Vec2::new(1.0, 1.0)),
        corner(Vec2::new(-1.0, 1.0), Vec2::new(0.0, 1.0)),
    ]
}

fn checkerboard(size: u32) -> anyhow::Result<Pixels> {
    let mut data = Vec::with_capacity((size * size * 4) as usize);
    for y in 0..size {
        for x in 0..size {
            let light = ((x / 8) + (y / 8)) % 2 == 0;
            let value = if light { 230 } else { 40 };
            data.extend_from_slice(&[value, value, value, 255]);
        }
    }
    Ok(Pixels::new(size, size, TextureFormat::Rgba, data)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use vkproc_core::CommandKind;

    #[test]
    fn unrotated_quad_is_axis_aligned() {
        let quad = rotated_quad(Vec2::new(10.0, 10.0), 2.0, 0.0, [255; 4]);
        assert!((quad[0].pos - Vec2::new(8.0, 8.0)).length() < 1e-5);
        assert!((quad[2].pos - Vec2::new(12.0, 12.0)).length() < 1e-5);
        assert_eq!(quad[1].tex, Vec2::new(1.0, 0.0));
    }

    #[test]
    fn texture_is_created_once() {
        let mut scene = Scene::new();
        let first: Vec<_> = scene.frame_commands(0.0, 640, 480).unwrap().iter().map(Command::kind).collect();
        assert_eq!(
            first,
            vec![CommandKind::TextureCreate, CommandKind::Clear, CommandKind::Render, CommandKind::Render]
        );
        let second = scene.frame_commands(1.0, 640, 480).unwrap();
        assert_eq!(second.len(), 3);
    }
}
