use std::collections::HashMap;
use std::fmt::{Display, Formatter, Write};
use std::time::Duration;

use petgraph::graph::NodeIndex;

use crate::runner::TaskExecution;
use crate::task::TaskId;

/// A task whose body returned an error or panicked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFailure {
    pub id: TaskId,
    pub name: String,
    pub message: String,
}

/// Frame diagnostics and performance metrics.
///
/// Returned by [`crate::TaskQueue::wait_for_tasks`] once the frame is drained.
/// It owns a snapshot of the task names and edges, so it can still be
/// rendered after the queue has been flushed.
#[derive(Debug, Clone, Default)]
pub struct Diagnostics {
    /// Frame generation the tasks belonged to.
    pub frame: u64,
    /// Size of the worker pool.
    pub workers: usize,
    /// Task names, indexed by [`TaskId::index`].
    pub names: Vec<String>,
    /// Resolved dependency edges `(before, after)`.
    pub edges: Vec<(TaskId, TaskId)>,
    /// A map of task ids to their execution metrics.
    pub execution_times: HashMap<TaskId, TaskExecution>,
    pub failures: Vec<TaskFailure>,
    /// Highest number of tasks observed running at the same time.
    pub peak_concurrency: usize,
    /// Time between dispatch and the last task reporting back.
    pub wall_time: Duration,
}

impl Diagnostics {
    pub(crate) fn empty(frame: u64, workers: usize) -> Self {
        Self {
            frame,
            workers,
            ..Default::default()
        }
    }

    /// `true` when no task of the frame failed.
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    /// Number of tasks that ran this frame.
    pub fn executed(&self) -> usize {
        self.execution_times.len()
    }

    /// Sum of the time spent inside task bodies, across all workers.
    pub fn busy_time(&self) -> Duration {
        self.execution_times.values().map(|t| t.duration).sum()
    }

    pub fn name(&self, id: TaskId) -> Option<&str> {
        self.names.get(id.index()).map(String::as_str)
    }

    fn is_failed(&self, id: TaskId) -> bool {
        self.failures.iter().any(|f| f.id == id)
    }

    fn ids(&self) -> impl Iterator<Item = TaskId> + '_ {
        (0..self.names.len()).map(|i| TaskId::new(NodeIndex::new(i), self.frame))
    }

    /// Fastest and slowest task duration in seconds, `None` if nothing ran.
    fn duration_range(&self) -> Option<(f64, f64)> {
        self.execution_times
            .values()
            .map(|t| t.duration.as_secs_f64())
            .fold(None, |range, secs| match range {
                None => Some((secs, secs)),
                Some((lo, hi)) => Some((f64::min(lo, secs), f64::max(hi, secs))),
            })
    }

    /// Renders the frame's task graph as a Mermaid flowchart.
    ///
    /// Nodes are shaded from green (fastest task of the frame) to red
    /// (slowest). Failed tasks are pink, tasks that never ran are grey.
    pub fn render_mermaid(&self) -> String {
        let mut out = String::new();
        // Writing into a String can't fail.
        let _ = self.write_mermaid(&mut out);
        out
    }

    fn write_mermaid(&self, out: &mut String) -> std::fmt::Result {
        writeln!(out, "graph LR")?;

        let (fastest, slowest) = self.duration_range().unwrap_or_default();
        let spread = (slowest - fastest).max(f64::EPSILON);

        for id in self.ids() {
            let index = id.index();
            let name = self.names[index].replace('"', "\\\"");

            let (label, fill) = match self.execution_times.get(&id) {
                None => (String::from("Not run"), Shade::NotRun.to_string()),
                Some(_) if self.is_failed(id) => (String::from("Failed"), Shade::Failed.to_string()),
                Some(exec) => {
                    let t = (exec.duration.as_secs_f64() - fastest) / spread;
                    (format!("{:.2?}", exec.duration), Shade::Heat(t).to_string())
                }
            };

            writeln!(out, "    {index}[\"{name}\\n{label}\"]")?;
            writeln!(out, "    style {index} fill:{fill}")?;
        }

        for (before, after) in &self.edges {
            writeln!(out, "    {} --> {}", before.index(), after.index())?;
        }

        Ok(())
    }
}

/// Node colour in the Mermaid rendering.
enum Shade {
    NotRun,
    Failed,
    /// Relative duration, 0.0 is the fastest task and 1.0 the slowest.
    Heat(f64),
}

impl Display for Shade {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match *self {
            Shade::NotRun => f.write_str("#D3D3D3"),
            Shade::Failed => f.write_str("#F4A6A6"),
            Shade::Heat(t) => {
                let t = t.clamp(0.0, 1.0);
                // green -> yellow -> red
                let red = (510.0 * t).min(255.0) as u8;
                let green = (510.0 * (1.0 - t)).min(255.0) as u8;
                write!(f, "#{red:02X}{green:02X}00")
            }
        }
    }
}

/// Escapes text for SVG content and attributes.
struct Escaped<'a>(&'a str);

impl Display for Escaped<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let mut rest = self.0;
        while let Some(pos) = rest.find(['<', '>', '&', '"', '\'']) {
            f.write_str(&rest[..pos])?;
            f.write_str(match rest.as_bytes()[pos] {
                b'<' => "&lt;",
                b'>' => "&gt;",
                b'&' => "&amp;",
                b'"' => "&quot;",
                _ => "&apos;",
            })?;
            rest = &rest[pos + 1..];
        }
        f.write_str(rest)
    }
}

const ROW: u32 = 22;
const LABEL: u32 = 220;
const CHART: u32 = 760;
const MARGIN: u32 = 10;
const HEADER: u32 = 44;
const TRAILER: u32 = 80;
const TICKS: u32 = 4;

/// Bar colours, one per worker thread, cycled.
const WORKER_FILLS: [&str; 6] = [
    "#3b82f6", "#10b981", "#8b5cf6", "#f59e0b", "#06b6d4", "#64748b",
];

fn pretty_micros(micros: f64) -> String {
    match micros {
        m if m < 1_000.0 => format!("{m:.0}µs"),
        m if m < 1_000_000.0 => format!("{:.2}ms", m / 1_000.0),
        m => format!("{:.2}s", m / 1_000_000.0),
    }
}

impl Diagnostics {
    /// Writes [`Diagnostics::render_waterfall`] to `path`.
    pub fn render_waterfall_to_file(
        &self,
        path: impl AsRef<std::path::Path>,
    ) -> Result<(), std::io::Error> {
        std::fs::write(path, self.render_waterfall())
    }

    /// Renders the frame as an SVG timeline.
    ///
    /// There is one row per executed task, in start order. Bars are coloured
    /// by the worker that ran them, failed tasks are drawn in red.
    pub fn render_waterfall(&self) -> String {
        let mut rows: Vec<_> = self.execution_times.iter().collect();
        rows.sort_by_key(|(id, exec)| (exec.start, **id));

        let Some(origin) = rows.first().map(|(_, exec)| exec.start) else {
            return String::from(
                r#"<svg width="200" height="40" xmlns="http://www.w3.org/2000/svg"><text x="10" y="25" font-family="sans-serif">No tasks ran</text></svg>"#,
            );
        };

        let span_micros = rows
            .iter()
            .map(|(_, exec)| (exec.start + exec.duration).duration_since(origin))
            .max()
            .unwrap_or_default()
            .as_micros()
            .max(1) as f64;

        let width = LABEL + CHART + TRAILER + 3 * MARGIN;
        let height = HEADER + rows.len() as u32 * ROW + MARGIN;
        let scale = |micros: f64| f64::from(LABEL + MARGIN) + micros / span_micros * f64::from(CHART);

        let mut svg = String::with_capacity(512 + rows.len() * 400);
        let _ = self.write_waterfall(&mut svg, &rows, origin, span_micros, width, height, scale);
        svg
    }

    #[allow(clippy::too_many_arguments)]
    fn write_waterfall(
        &self,
        svg: &mut String,
        rows: &[(&TaskId, &TaskExecution)],
        origin: std::time::Instant,
        span_micros: f64,
        width: u32,
        height: u32,
        scale: impl Fn(f64) -> f64,
    ) -> std::fmt::Result {
        write!(
            svg,
            r#"<svg width="{width}" height="{height}" xmlns="http://www.w3.org/2000/svg" font-family="sans-serif" font-size="12"><rect width="100%" height="100%" fill="white" />"#
        )?;

        write!(
            svg,
            r##"<text x="{MARGIN}" y="16" fill="#111">frame {} · {} tasks · {} workers · peak {} · {}</text>"##,
            self.frame,
            rows.len(),
            self.workers,
            self.peak_concurrency,
            pretty_micros(self.wall_time.as_micros() as f64),
        )?;

        for tick in 0..=TICKS {
            let micros = span_micros * f64::from(tick) / f64::from(TICKS);
            let x = scale(micros);
            write!(
                svg,
                r##"<line x1="{x:.1}" y1="{HEADER}" x2="{x:.1}" y2="{height}" stroke="#e5e7eb" /><text x="{x:.1}" y="{}" text-anchor="middle" fill="#9ca3af" font-size="10">{}</text>"##,
                HEADER - 6,
                pretty_micros(micros),
            )?;
        }

        for (row, (id, exec)) in rows.iter().enumerate() {
            let top = HEADER + row as u32 * ROW;
            let middle = top + ROW / 2;
            let name = Escaped(self.name(**id).unwrap_or("?"));

            let fill = match exec.worker {
                _ if self.is_failed(**id) => "#ef4444",
                Some(worker) => WORKER_FILLS[worker % WORKER_FILLS.len()],
                None => "#94a3b8",
            };

            let offset = exec.start.duration_since(origin).as_micros() as f64;
            let length = exec.duration.as_micros() as f64;
            let x = scale(offset);
            let w = (scale(offset + length) - x).max(1.0);

            if row % 2 == 1 {
                write!(
                    svg,
                    r##"<rect x="0" y="{top}" width="100%" height="{ROW}" fill="#f8fafc" />"##
                )?;
            }

            let worker = exec.worker.map(|w| format!(" #{w}")).unwrap_or_default();
            write!(
                svg,
                r##"<text x="{MARGIN}" y="{middle}" dominant-baseline="middle" fill="#333">{name}{worker}</text>"##
            )?;
            write!(
                svg,
                r#"<rect x="{x:.1}" y="{}" width="{w:.1}" height="{}" rx="3" fill="{fill}"><title>{name}: {:.2?}</title></rect>"#,
                top + 4,
                ROW - 8,
                exec.duration,
            )?;
            write!(
                svg,
                r##"<text x="{:.1}" y="{middle}" dominant-baseline="middle" fill="#666" font-size="11">{}</text>"##,
                x + w + 5.0,
                pretty_micros(length),
            )?;
        }

        svg.push_str("</svg>");
        Ok(())
    }
}
