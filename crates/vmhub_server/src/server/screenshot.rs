#![forbid(unsafe_code)]

use std::io::Cursor;

use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat, RgbaImage, imageops};
use tracing::debug;
use vmhub_protocol::messages::{DisplayPng, DisplaySize, GuacServerInstr, guac_server_instr};

/// Off-screen composition of a VM's display stream. Fed with the same
/// instructions viewers receive; renders thumbnails for the VM list and
/// keyframe snapshots for recordings.
#[derive(Default)]
pub struct DisplayCanvas {
	canvas: Option<RgbaImage>,
}

impl DisplayCanvas {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn handle_instruction(&mut self, instr: &GuacServerInstr) {
		use guac_server_instr::Instr;
		match instr.instr.as_ref() {
			Some(Instr::Size(size)) => self.resize(size),
			Some(Instr::Png(png)) => self.draw(png),
			_ => {}
		}
	}

	fn resize(&mut self, size: &DisplaySize) {
		if size.layer != 0 || size.width == 0 || size.height == 0 {
			return;
		}
		let mut fresh = RgbaImage::new(size.width, size.height);
		if let Some(old) = self.canvas.take() {
			imageops::overlay(&mut fresh, &old, 0, 0);
		}
		self.canvas = Some(fresh);
	}

	fn draw(&mut self, png: &DisplayPng) {
		if png.layer != 0 {
			return;
		}
		let decoded = match image::load_from_memory(&png.data) {
			Ok(img) => img.to_rgba8(),
			Err(e) => {
				debug!(error = %e, "undecodable png draw instruction");
				return;
			}
		};

		let canvas = self.canvas.get_or_insert_with(|| RgbaImage::new(decoded.width(), decoded.height()));
		imageops::overlay(canvas, &decoded, i64::from(png.x), i64::from(png.y));
	}

	/// Render a PNG scaled to fit (max_width, max_height) preserving the
	/// aspect ratio; zero maxima render at native size.
	pub fn render_png(&self, max_width: u32, max_height: u32) -> Option<Vec<u8>> {
		let canvas = self.canvas.as_ref()?;

		let (width, height) = if max_width == 0 || max_height == 0 {
			(canvas.width(), canvas.height())
		} else if canvas.width() > canvas.height() {
			let scale = f64::from(max_width) / f64::from(canvas.width());
			(max_width, ((f64::from(canvas.height()) * scale) as u32).max(1))
		} else {
			let scale = f64::from(max_height) / f64::from(canvas.height());
			(((f64::from(canvas.width()) * scale) as u32).max(1), max_height)
		};

		let scaled = if (width, height) == (canvas.width(), canvas.height()) {
			canvas.clone()
		} else {
			imageops::resize(canvas, width, height, FilterType::Lanczos3)
		};

		let mut out = Cursor::new(Vec::new());
		match DynamicImage::ImageRgba8(scaled).write_to(&mut out, ImageFormat::Png) {
			Ok(()) => Some(out.into_inner()),
			Err(e) => {
				debug!(error = %e, "thumbnail encode failed");
				None
			}
		}
	}

	/// Snapshot the current display as a self-contained instruction
	/// sequence. Written into recordings at keyframes so playback can seek
	/// without replaying everything before the keyframe.
	pub fn keyframe_instructions(&self) -> Vec<GuacServerInstr> {
		use guac_server_instr::Instr;
		let Some(canvas) = self.canvas.as_ref() else {
			return Vec::new();
		};
		let Some(png) = self.render_png(0, 0) else {
			return Vec::new();
		};

		vec![
			GuacServerInstr {
				instr: Some(Instr::Size(DisplaySize {
					layer: 0,
					width: canvas.width(),
					height: canvas.height(),
				})),
			},
			GuacServerInstr {
				instr: Some(Instr::Png(DisplayPng {
					layer: 0,
					x: 0,
					y: 0,
					data: png,
				})),
			},
		]
	}
}

/// Encode a solid-color RGBA patch as PNG, for synthesizing display
/// streams in tests.
#[cfg(test)]
pub fn solid_png(width: u32, height: u32, rgba: [u8; 4]) -> Vec<u8> {
	let img = RgbaImage::from_pixel(width, height, image::Rgba(rgba));
	let mut out = Cursor::new(Vec::new());
	DynamicImage::ImageRgba8(img)
		.write_to(&mut out, ImageFormat::Png)
		.expect("encode solid png");
	out.into_inner()
}
