use crate::collectors::docker::ContainerStats;
use crate::collectors::system::ProcessStat;
use crate::collectors::{CpuSample, DiskSample, MemorySample};
use crate::format::truncate_chars;
use image::{DynamicImage, ImageFormat, RgbImage};
use plotters::prelude::*;
use std::io::Cursor;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChartError {
    #[error("nothing to draw")]
    Empty,
    #[error("chart rendering failed: {0}")]
    Render(String),
    #[error("image buffer conversion failed")]
    Buffer,
    #[error("png encoding failed: {0}")]
    Encode(#[from] image::ImageError),
}

struct ChartStyle;

impl ChartStyle {
    const MARGIN: i32 = 16;
    const FONT_FAMILY: &'static str = "sans-serif";
    const CAPTION_FONT_SIZE: i32 = 28;
    const VALUE_FONT_SIZE: i32 = 15;
    const X_LABEL_AREA_SIZE: u32 = 48;
    const Y_LABEL_AREA_SIZE: u32 = 56;
    const BAR_GAP_PX: u32 = 6;
    const BACKGROUND: RGBColor = WHITE;
    const DANGER: RGBColor = RGBColor(231, 76, 60);
    const WARNING: RGBColor = RGBColor(243, 156, 18);
    const OK: RGBColor = RGBColor(46, 204, 113);
    const NEUTRAL: RGBColor = RGBColor(52, 152, 219);

    fn level_color(value: f64) -> RGBColor {
        if value > 80.0 {
            Self::DANGER
        } else if value > 60.0 {
            Self::WARNING
        } else {
            Self::OK
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Bar {
    pub label: String,
    pub value: f64,
}

impl Bar {
    pub fn new(label: impl Into<String>, value: f64) -> Self {
        Self {
            label: label.into(),
            value,
        }
    }
}

/// Vertical bar chart. Percent charts are colored by level, others use a
/// single neutral color.
#[derive(Debug, Clone)]
pub struct BarChart {
    pub title: String,
    pub y_desc: String,
    pub bars: Vec<Bar>,
    pub percent: bool,
}

impl BarChart {
    pub fn percent(title: impl Into<String>, bars: Vec<Bar>) -> Self {
        Self {
            title: title.into(),
            y_desc: "Usage %".to_string(),
            bars,
            percent: true,
        }
    }

    fn y_max(&self) -> f64 {
        let top = self.bars.iter().map(|b| b.value).fold(0.0_f64, f64::max);
        if self.percent && top <= 100.0 {
            100.0
        } else {
            (top * 1.15).max(1.0)
        }
    }

    fn color(&self, value: f64) -> RGBColor {
        if self.percent {
            ChartStyle::level_color(value)
        } else {
            ChartStyle::NEUTRAL
        }
    }

    pub fn render_png(&self, width: u32, height: u32) -> Result<Vec<u8>, ChartError> {
        if self.bars.is_empty() {
            return Err(ChartError::Empty);
        }

        let mut rgb_buffer = vec![255u8; width as usize * height as usize * 3];
        {
            let drawing_area =
                BitMapBackend::with_buffer(&mut rgb_buffer, (width, height)).into_drawing_area();
            drawing_area.fill(&ChartStyle::BACKGROUND).map_err(render_err)?;

            let count = self.bars.len() as u32;
            let y_max = self.y_max();
            let labels: Vec<String> = self
                .bars
                .iter()
                .map(|b| truncate_chars(&b.label, 14))
                .collect();

            let mut chart = ChartBuilder::on(&drawing_area)
                .margin(ChartStyle::MARGIN)
                .caption(
                    &self.title,
                    (ChartStyle::FONT_FAMILY, ChartStyle::CAPTION_FONT_SIZE),
                )
                .x_label_area_size(ChartStyle::X_LABEL_AREA_SIZE)
                .y_label_area_size(ChartStyle::Y_LABEL_AREA_SIZE)
                .build_cartesian_2d((0u32..count).into_segmented(), 0.0..y_max)
                .map_err(render_err)?;

            chart
                .configure_mesh()
                .disable_x_mesh()
                .x_labels(labels.len())
                .x_label_formatter(&|v| match v {
                    SegmentValue::CenterOf(i) | SegmentValue::Exact(i) => {
                        labels.get(*i as usize).cloned().unwrap_or_default()
                    }
                    SegmentValue::Last => String::new(),
                })
                .y_desc(self.y_desc.as_str())
                .draw()
                .map_err(render_err)?;

            chart
                .draw_series(self.bars.iter().enumerate().map(|(i, bar)| {
                    let i = i as u32;
                    let mut rect = Rectangle::new(
                        [
                            (SegmentValue::Exact(i), 0.0),
                            (SegmentValue::Exact(i + 1), bar.value.max(0.0)),
                        ],
                        self.color(bar.value).filled(),
                    );
                    rect.set_margin(0, 0, ChartStyle::BAR_GAP_PX, ChartStyle::BAR_GAP_PX);
                    rect
                }))
                .map_err(render_err)?;

            let suffix = if self.percent { "%" } else { "" };
            chart
                .draw_series(self.bars.iter().enumerate().map(|(i, bar)| {
                    Text::new(
                        format!("{:.1}{suffix}", bar.value),
                        (
                            SegmentValue::CenterOf(i as u32),
                            (bar.value.max(0.0) + y_max * 0.02).min(y_max),
                        ),
                        (ChartStyle::FONT_FAMILY, ChartStyle::VALUE_FONT_SIZE)
                            .into_font()
                            .color(&BLACK),
                    )
                }))
                .map_err(render_err)?;

            drawing_area.present().map_err(render_err)?;
        }

        let rgb_image = RgbImage::from_raw(width, height, rgb_buffer).ok_or(ChartError::Buffer)?;
        let mut output = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(rgb_image).write_to(&mut output, ImageFormat::Png)?;
        Ok(output.into_inner())
    }
}

fn render_err<E: std::fmt::Debug>(err: E) -> ChartError {
    ChartError::Render(format!("{err:?}"))
}

pub fn cpu_chart(cpu: &CpuSample) -> BarChart {
    let bars = cpu
        .per_core
        .iter()
        .enumerate()
        .map(|(i, v)| Bar::new(format!("CPU{i}"), *v))
        .collect();
    BarChart::percent(format!("CPU usage per core ({:.1}% avg)", cpu.percent), bars)
}

pub fn memory_chart(memory: &MemorySample) -> BarChart {
    let mut bars = vec![Bar::new("RAM", memory.percent)];
    if memory.swap_total_bytes > 0 {
        bars.push(Bar::new("Swap", memory.swap_percent()));
    }
    BarChart::percent("Memory usage", bars)
}

pub fn disk_chart(disks: &[DiskSample]) -> BarChart {
    let bars = disks
        .iter()
        .map(|d| Bar::new(d.mount_point.clone(), d.percent))
        .collect();
    BarChart::percent("Disk usage", bars)
}

pub fn process_chart(processes: &[ProcessStat]) -> BarChart {
    let bars = processes
        .iter()
        .map(|p| Bar::new(p.name.clone(), p.cpu_percent))
        .collect();
    BarChart::percent("Top processes by CPU", bars)
}

pub fn container_chart(stats: &[ContainerStats]) -> BarChart {
    let bars = stats
        .iter()
        .flat_map(|s| {
            [
                Bar::new(format!("{} cpu", s.name), s.cpu_percent),
                Bar::new(format!("{} mem", s.name), s.mem_percent),
            ]
        })
        .collect();
    BarChart::percent("Container CPU / memory", bars)
}
