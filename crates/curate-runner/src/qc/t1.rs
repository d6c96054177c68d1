//! T1w rating pages: slice PNGs grouped per session into a single HTML file
//! with client-side CSV export, and optional slice rendering from NIfTI.

use super::glob_sorted;
use anyhow::{anyhow, Result};
use crc32fast::Hasher;
use curate_core::{atomic_write_bytes, ensure_dir, file_name_str, to_posix};
use flate2::write::ZlibEncoder;
use flate2::Compression;
use ndarray::{ArrayD, Axis, IxDyn};
use nifti::{IntoNdArray, NiftiHeader, NiftiObject, ReaderOptions};
use regex::Regex;
use serde_json::json;
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::sync::OnceLock;
use tracing::{info, warn};

pub const DEFAULT_VIEWS: [&str; 4] = ["S1", "S3", "A2", "A3"];
pub const DEFAULT_PNG_PATTERN: &str = "sub-*_ses-*_*.png";
pub const DEFAULT_NIFTI_PATTERN: &str = "sub-*/ses-*/anat/*_T1w.nii.gz";
pub const DEFAULT_SAGITTAL: [f64; 2] = [0.2, 0.8];
pub const DEFAULT_AXIAL: [f64; 2] = [0.4, 0.6];
pub const ASSETS_DIR: &str = "assets";

const PNG_SIGNATURE: [u8; 8] = [137, 80, 78, 71, 13, 10, 26, 10];

fn png_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(sub-[^_]+)_(ses-[^_]+)_([^.]+)\.png$").expect("static regex"))
}

fn entity_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(sub-[^_]+).*?(ses-[^_]+)").expect("static regex"))
}

#[derive(Debug, Clone)]
pub struct SliceOptions {
    pub nifti_root: PathBuf,
    pub nifti_pattern: String,
    pub png_outdir: PathBuf,
    pub sagittal: [f64; 2],
    pub axial: [f64; 2],
}

impl SliceOptions {
    pub fn new(nifti_root: impl Into<PathBuf>, png_outdir: impl Into<PathBuf>) -> Self {
        Self {
            nifti_root: nifti_root.into(),
            nifti_pattern: DEFAULT_NIFTI_PATTERN.to_string(),
            png_outdir: png_outdir.into(),
            sagittal: DEFAULT_SAGITTAL,
            axial: DEFAULT_AXIAL,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SliceReport {
    pub images: usize,
    pub pngs: Vec<PathBuf>,
    /// Images that could not be rendered, with the error.
    pub failed: Vec<(PathBuf, String)>,
}

#[derive(Debug, Clone)]
pub struct T1HtmlOptions {
    pub root: PathBuf,
    pub out: PathBuf,
    pub views: Vec<String>,
    pub pattern: String,
    pub allow_missing: bool,
    /// Copy images into `assets/` next to the page instead of linking them.
    pub portable: bool,
}

impl T1HtmlOptions {
    pub fn new(root: impl Into<PathBuf>, out: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            out: out.into(),
            views: DEFAULT_VIEWS.iter().map(|v| v.to_string()).collect(),
            pattern: DEFAULT_PNG_PATTERN.to_string(),
            allow_missing: false,
            portable: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct T1HtmlReport {
    pub rows: usize,
    pub views: usize,
    pub copied: usize,
    pub html: PathBuf,
}

#[derive(Debug, Clone, PartialEq)]
pub struct T1Row {
    pub sub: String,
    pub ses: String,
    pub images: BTreeMap<String, PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum LabelKey {
    Number(u64),
    Text(String),
}

fn label_key(label: &str, prefix: &str) -> LabelKey {
    label
        .strip_prefix(prefix)
        .filter(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
        .and_then(|n| n.parse().ok())
        .map(LabelKey::Number)
        .unwrap_or_else(|| LabelKey::Text(label.to_string()))
}

/// Groups `sub-*_ses-*_VIEW.png` files under `root` by session, numerically
/// sorted. Rows missing a view are dropped unless `allow_missing`.
pub fn collect_rows(root: &Path, pattern: &str, views: &[String], allow_missing: bool) -> Result<Vec<T1Row>> {
    let mut grouped: BTreeMap<(String, String), BTreeMap<String, PathBuf>> = BTreeMap::new();
    for path in glob_sorted(root, pattern)? {
        let Some(caps) = png_name_re().captures(file_name_str(&path)) else {
            continue;
        };
        let view = caps[3].to_string();
        if !views.contains(&view) {
            continue;
        }
        grouped
            .entry((caps[1].to_string(), caps[2].to_string()))
            .or_default()
            .insert(view, path);
    }
    let mut rows: Vec<T1Row> = grouped
        .into_iter()
        .map(|((sub, ses), images)| T1Row { sub, ses, images })
        .filter(|row| allow_missing || views.iter().all(|v| row.images.contains_key(v)))
        .collect();
    rows.sort_by_key(|row| (label_key(&row.sub, "sub-"), label_key(&row.ses, "ses-")));
    Ok(rows)
}

/// Writes the rating page and returns what went into it.
pub fn t1_qc_html(opts: &T1HtmlOptions) -> Result<T1HtmlReport> {
    let rows = collect_rows(&opts.root, &opts.pattern, &opts.views, opts.allow_missing)?;
    if rows.is_empty() {
        return Err(anyhow!(
            "no rows found under {}; file names must match 'sub-*_ses-*_VIEW.png'",
            opts.root.display()
        ));
    }
    let out_dir = match opts.out.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    ensure_dir(&out_dir)?;
    let out_dir = fs::canonicalize(&out_dir)?;

    let mut copied = 0;
    let mut data = Vec::with_capacity(rows.len());
    for row in &rows {
        let mut images = serde_json::Map::new();
        for view in &opts.views {
            let src = match row.images.get(view) {
                Some(path) if opts.portable => {
                    let assets = out_dir.join(ASSETS_DIR);
                    ensure_dir(&assets)?;
                    let name = file_name_str(path);
                    fs::copy(path, assets.join(name))?;
                    copied += 1;
                    format!("{}/{}", ASSETS_DIR, name)
                }
                Some(path) => to_posix(&relative_path(&fs::canonicalize(path)?, &out_dir)),
                None => String::new(),
            };
            images.insert(view.clone(), json!(src));
        }
        data.push(json!({"sub": row.sub, "ses": row.ses, "images": images}));
    }

    let html = render_html(&serde_json::to_string(&data)?, &serde_json::to_string(&opts.views)?);
    atomic_write_bytes(&opts.out, html.as_bytes())?;
    info!(rows = rows.len(), copied, out = %opts.out.display(), "wrote T1 rating page");
    Ok(T1HtmlReport {
        rows: rows.len(),
        views: opts.views.len(),
        copied,
        html: opts.out.clone(),
    })
}

fn relative_path(target: &Path, base: &Path) -> PathBuf {
    let t: Vec<Component> = target.components().collect();
    let b: Vec<Component> = base.components().collect();
    let common = t.iter().zip(&b).take_while(|(x, y)| x == y).count();
    let mut out = PathBuf::new();
    for _ in common..b.len() {
        out.push("..");
    }
    for part in &t[common..] {
        out.push(part.as_os_str());
    }
    out
}

fn render_html(data_json: &str, views_json: &str) -> String {
    // `</` inside a script block would end it early.
    PAGE_TEMPLATE
        .replace("__DATA__", &data_json.replace("</", "<\\/"))
        .replace("__VIEWS__", &views_json.replace("</", "<\\/"))
}

/// Renders S1/S3 sagittal and A2/A3 axial PNGs for every T1w image found.
/// Per-image failures are collected and never stop the batch.
pub fn generate_slices(opts: &SliceOptions) -> Result<SliceReport> {
    let images = glob_sorted(&opts.nifti_root, &opts.nifti_pattern)?;
    let mut report = SliceReport {
        images: images.len(),
        ..SliceReport::default()
    };
    if images.is_empty() {
        warn!(root = %opts.nifti_root.display(), pattern = %opts.nifti_pattern, "no NIfTI files found");
        return Ok(report);
    }
    ensure_dir(&opts.png_outdir)?;
    info!(images = images.len(), out = %opts.png_outdir.display(), "rendering T1 slices");
    for image in &images {
        let Some(caps) = entity_re().captures(file_name_str(image)) else {
            continue;
        };
        let prefix = format!("{}_{}", &caps[1], &caps[2]);
        match render_image(image, &prefix, opts) {
            Ok(pngs) => report.pngs.extend(pngs),
            Err(err) => {
                warn!(path = %image.display(), error = %err, "slice rendering failed");
                report.failed.push((image.clone(), err.to_string()));
            }
        }
    }
    Ok(report)
}

fn render_image(image: &Path, prefix: &str, opts: &SliceOptions) -> Result<Vec<PathBuf>> {
    let obj = ReaderOptions::new().read_file(image)?;
    let header = obj.header().clone();
    let mut data = obj.into_volume().into_ndarray::<f32>()?;
    while data.ndim() > 3 {
        if data.shape()[3] != 1 {
            return Err(anyhow!("expected a 3D image, got shape {:?}", data.shape()));
        }
        data = data.index_axis_move(Axis(3), 0);
    }
    if data.ndim() != 3 {
        return Err(anyhow!("expected a 3D image, got shape {:?}", data.shape()));
    }
    data.mapv_inplace(|v| if v.is_finite() { v } else { 0.0 });
    let vol = normalize(&to_ras(data, &header));
    let (nx, ny, nz) = (vol.shape()[0], vol.shape()[1], vol.shape()[2]);

    let mut written = Vec::new();
    for (frac, tag) in opts.sagittal.iter().zip(["S1", "S3"]) {
        let ix = slice_index(*frac, nx);
        let png = slice_png(ny, nz, |row, col| vol[[ix, col, row]])?;
        written.push(write_png(&opts.png_outdir, prefix, tag, &png)?);
    }
    for (frac, tag) in opts.axial.iter().zip(["A2", "A3"]) {
        let iz = slice_index(*frac, nz);
        let png = slice_png(nx, ny, |row, col| vol[[col, row, iz]])?;
        written.push(write_png(&opts.png_outdir, prefix, tag, &png)?);
    }
    Ok(written)
}

fn write_png(dir: &Path, prefix: &str, tag: &str, png: &[u8]) -> Result<PathBuf> {
    let path = dir.join(format!("{}_{}.png", prefix, tag));
    atomic_write_bytes(&path, png)?;
    Ok(path)
}

fn slice_index(frac: f64, len: usize) -> usize {
    let last = len.saturating_sub(1);
    let idx = (frac * last as f64).round_ties_even();
    if idx <= 0.0 {
        0
    } else {
        (idx as usize).min(last)
    }
}

/// World direction of each voxel axis, from sform, then qform, then identity.
fn voxel_directions(header: &NiftiHeader) -> [[f64; 3]; 3] {
    if header.sform_code > 0 {
        let rows = [header.srow_x, header.srow_y, header.srow_z];
        return [0, 1, 2].map(|j| [0, 1, 2].map(|i| rows[i][j] as f64));
    }
    if header.qform_code > 0 {
        let (b, c, d) = (
            header.quatern_b as f64,
            header.quatern_c as f64,
            header.quatern_d as f64,
        );
        let a = (1.0 - (b * b + c * c + d * d)).max(0.0).sqrt();
        let qfac = if header.pixdim[0] < 0.0 { -1.0 } else { 1.0 };
        let r = [
            [a * a + b * b - c * c - d * d, 2.0 * (b * c - a * d), 2.0 * (b * d + a * c)],
            [2.0 * (b * c + a * d), a * a + c * c - b * b - d * d, 2.0 * (c * d - a * b)],
            [2.0 * (b * d - a * c), 2.0 * (c * d + a * b), a * a + d * d - b * b - c * c],
        ];
        return [0, 1, 2].map(|j| {
            let scale = if j == 2 { qfac } else { 1.0 };
            [0, 1, 2].map(|i| r[i][j] * scale)
        });
    }
    [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]]
}

/// For each RAS axis, the voxel axis closest to it and whether it runs backwards.
fn ras_axes(directions: &[[f64; 3]; 3]) -> [(usize, bool); 3] {
    let mut out = [(0, false), (1, false), (2, false)];
    let mut taken = [false; 3];
    for (j, dir) in directions.iter().enumerate() {
        let world = (0..3)
            .filter(|&i| !taken[i])
            .fold(None, |best: Option<usize>, i| match best {
                Some(b) if dir[b].abs() >= dir[i].abs() => Some(b),
                _ => Some(i),
            })
            .unwrap_or(j);
        taken[world] = true;
        out[world] = (j, dir[world] < 0.0);
    }
    out
}

fn to_ras(data: ArrayD<f32>, header: &NiftiHeader) -> ArrayD<f32> {
    let axes = ras_axes(&voxel_directions(header));
    let perm: Vec<usize> = axes.iter().map(|(j, _)| *j).collect();
    let mut ras = data.permuted_axes(IxDyn(&perm));
    for (i, (_, flip)) in axes.iter().enumerate() {
        if *flip {
            ras.invert_axis(Axis(i));
        }
    }
    ras
}

fn percentile(sorted: &[f32], p: f64) -> f64 {
    if sorted.is_empty() {
        return f64::NAN;
    }
    let pos = p / 100.0 * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let (a, b) = (sorted[lo] as f64, sorted[hi] as f64);
    a + (b - a) * (pos - lo as f64)
}

/// Maps intensities onto [0, 1] between the 2nd and 98th percentiles.
fn normalize(data: &ArrayD<f32>) -> ArrayD<f32> {
    let mut sorted: Vec<f32> = data.iter().copied().collect();
    sorted.sort_by(f32::total_cmp);
    let (mut lo, mut hi) = (percentile(&sorted, 2.0), percentile(&sorted, 98.0));
    if !(lo.is_finite() && hi.is_finite()) || hi <= lo {
        lo = sorted.first().map_or(f64::NAN, |v| *v as f64);
        hi = sorted.last().map_or(f64::NAN, |v| *v as f64);
    }
    if !lo.is_finite() {
        lo = 0.0;
    }
    if !hi.is_finite() || hi <= lo {
        hi = lo + 1.0;
    }
    let span = hi - lo + 1e-6;
    data.mapv(|v| ((v as f64 - lo) / span).clamp(0.0, 1.0) as f32)
}

fn slice_png(width: usize, height: usize, pixel: impl Fn(usize, usize) -> f32) -> Result<Vec<u8>> {
    let mut values = Vec::with_capacity(width * height);
    for row in 0..height {
        for col in 0..width {
            values.push(pixel(row, col));
        }
    }
    let lo = values.iter().copied().fold(f32::INFINITY, f32::min);
    let hi = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let span = if hi > lo { hi - lo } else { 1.0 };
    let bytes: Vec<u8> = values
        .iter()
        .map(|v| (((v - lo) / span).clamp(0.0, 1.0) * 255.0).round() as u8)
        .collect();
    encode_gray_png(width as u32, height as u32, &bytes)
}

fn png_chunk(out: &mut Vec<u8>, kind: &[u8; 4], body: &[u8]) {
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(kind);
    out.extend_from_slice(body);
    let mut crc = Hasher::new();
    crc.update(kind);
    crc.update(body);
    out.extend_from_slice(&crc.finalize().to_be_bytes());
}

fn encode_gray_png(width: u32, height: u32, pixels: &[u8]) -> Result<Vec<u8>> {
    if pixels.len() != width as usize * height as usize {
        return Err(anyhow!("{} pixels do not fill {}x{}", pixels.len(), width, height));
    }
    let mut ihdr = Vec::with_capacity(13);
    ihdr.extend_from_slice(&width.to_be_bytes());
    ihdr.extend_from_slice(&height.to_be_bytes());
    ihdr.extend_from_slice(&[8, 0, 0, 0, 0]);

    let mut zlib = ZlibEncoder::new(Vec::new(), Compression::default());
    if width > 0 {
        for row in pixels.chunks(width as usize) {
            zlib.write_all(&[0])?;
            zlib.write_all(row)?;
        }
    }
    let idat = zlib.finish()?;

    let mut out = PNG_SIGNATURE.to_vec();
    png_chunk(&mut out, b"IHDR", &ihdr);
    png_chunk(&mut out, b"IDAT", &idat);
    png_chunk(&mut out, b"IEND", &[]);
    Ok(out)
}

const PAGE_TEMPLATE: &str = r#"<!doctype html>
<html lang="en">
<head>
  <meta charset="utf-8" />
  <meta name="viewport" content="width=device-width, initial-scale=1" />
  <title>T1 QC Ratings</title>
  <style>
    body { font-family: system-ui, -apple-system, Segoe UI, Roboto, Arial, sans-serif; margin: 16px; }
    h1 { font-size: 20px; margin: 0 0 12px 0; }
    .controls { display: flex; gap: 8px; align-items: center; margin-bottom: 12px; flex-wrap: wrap; }
    .grid { display: grid; grid-template-columns: 1fr 1fr; gap: 12px; }
    .card { border: 1px solid #ddd; border-radius: 8px; padding: 8px; background: #fff; }
    .header { display: flex; align-items: baseline; justify-content: space-between; gap: 8px; margin-bottom: 8px; }
    .views { display: grid; grid-template-columns: repeat(4, minmax(0, 1fr)); gap: 8px; }
    .view { display: flex; flex-direction: column; gap: 6px; }
    .view img { width: 100%; height: auto; display: block; border: 1px solid #eee; border-radius: 4px; }
    .rating { display: flex; gap: 6px; align-items: center; flex-wrap: wrap; }
    .muted { color: #666; font-size: 12px; }
    .search { padding: 6px 10px; border: 1px solid #ccc; border-radius: 6px; min-width: 260px; }
    button { padding: 6px 10px; border: 1px solid #aaa; border-radius: 6px; background: #f7f7f7; cursor: pointer; }
    button.primary { background: #0b5; color: #fff; border-color: #0a4; }
  </style>
  <script>
    const DATA = __DATA__;
    const VIEWS = __VIEWS__;

    function escapeCsv(val) {
      if (val == null) return '';
      const s = String(val);
      if (s.includes('"') || s.includes(',') || s.includes('\n')) {
        return '"' + s.replace(/"/g, '""') + '"';
      }
      return s;
    }

    function toCSV() {
      const headers = ['subid', 'sesid', ...VIEWS.map(v => v + '_score')];
      const lines = [headers.join(',')];
      for (const card of document.querySelectorAll('[data-card]')) {
        const scores = VIEWS.map(v => {
          const el = card.querySelector(`[data-score="${v}"]`);
          return el ? el.value : '';
        });
        const row = [card.getAttribute('data-sub'), card.getAttribute('data-ses'), ...scores];
        lines.push(row.map(escapeCsv).join(','));
      }
      return lines.join('\n');
    }

    function downloadCSV() {
      const blob = new Blob([toCSV()], { type: 'text/csv;charset=utf-8;' });
      const url = URL.createObjectURL(blob);
      const a = document.createElement('a');
      a.href = url;
      a.download = 'T1qc_ratings.csv';
      document.body.appendChild(a);
      a.click();
      document.body.removeChild(a);
      URL.revokeObjectURL(url);
    }

    function render(filter) {
      const root = document.getElementById('root');
      root.innerHTML = '';
      const q = filter.trim().toLowerCase();
      const rows = DATA.filter(r => (r.sub + ' ' + r.ses).toLowerCase().includes(q));
      for (const row of rows) {
        const card = document.createElement('div');
        card.className = 'card';
        card.setAttribute('data-card', '');
        card.setAttribute('data-sub', row.sub);
        card.setAttribute('data-ses', row.ses);

        const header = document.createElement('div');
        header.className = 'header';
        const title = document.createElement('div');
        const strong = document.createElement('strong');
        strong.textContent = row.sub;
        const ses = document.createElement('span');
        ses.className = 'muted';
        ses.textContent = ' ' + row.ses;
        title.appendChild(strong);
        title.appendChild(ses);
        const hint = document.createElement('div');
        hint.className = 'muted';
        hint.textContent = 'Rate each view: 0=Fail, 1=Borderline, 2=Pass';
        header.appendChild(title);
        header.appendChild(hint);
        card.appendChild(header);

        const views = document.createElement('div');
        views.className = 'views';
        for (const v of VIEWS) {
          const box = document.createElement('div');
          box.className = 'view';
          const img = document.createElement('img');
          const src = row.images[v] || '';
          if (src) img.src = src;
          img.alt = `${row.sub} ${row.ses} ${v}`;
          const label = document.createElement('label');
          label.textContent = v;
          const select = document.createElement('select');
          select.setAttribute('data-score', v);
          for (const [val, name] of [['', ''], ['0', 'Fail'], ['1', 'Borderline'], ['2', 'Pass']]) {
            const opt = document.createElement('option');
            opt.value = val;
            opt.textContent = name;
            select.appendChild(opt);
          }
          const rating = document.createElement('div');
          rating.className = 'rating';
          rating.appendChild(label);
          rating.appendChild(select);
          box.appendChild(img);
          box.appendChild(rating);
          views.appendChild(box);
        }
        card.appendChild(views);
        root.appendChild(card);
      }
      document.getElementById('count').textContent = rows.length + ' rows';
    }

    window.addEventListener('DOMContentLoaded', () => {
      const search = document.getElementById('search');
      search.addEventListener('input', () => render(search.value));
      render('');
    });
  </script>
</head>
<body>
  <h1>T1 QC Ratings</h1>
  <div class="controls">
    <input id="search" class="search" type="search" placeholder="Filter by subject/session (e.g., sub-123 ses-1)" />
    <button class="primary" onclick="downloadCSV()">Download CSV</button>
    <span id="count" class="muted"></span>
  </div>
  <div id="root" class="grid"></div>
</body>
</html>
"#;
