//! Word lattices: the in-memory form produced by trace-back, the standard
//! lattice-file dialect they are written in (and read back from, for
//! rescoring), and forward-backward pruning.
//!
//! A lattice node is a point in time carrying a word identity; an arc
//! connects two nodes and carries the acoustic, language-model and
//! pronunciation log likelihoods of that word token, plus an optional
//! model-level alignment. Which arc fields get written is controlled by a
//! format string of single-character flags.
use crate::error::{DecodeError, Result};
use crate::logmath::LogFloat;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::io::{self, Write};
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq)]
pub struct LatNode {
    /// Time in seconds.
    pub time: f64,
    pub word: String,
    /// 1-based pronunciation variant.
    pub variant: u32,
}

/// One model of an arc's alignment: label plus length in frames.
#[derive(Debug, Clone, PartialEq)]
pub struct AlignSeg {
    pub label: String,
    pub frames: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LatArc {
    pub start: u32,
    pub end: u32,
    pub aclike: LogFloat,
    pub lmlike: LogFloat,
    pub prlike: LogFloat,
    pub align: Vec<AlignSeg>,
}

#[derive(Debug, Clone)]
pub struct Lattice {
    pub utterance: Option<String>,
    pub lm_scale: f64,
    pub ac_scale: f64,
    pub pr_scale: f64,
    pub wd_penalty: f64,
    /// Frame duration in seconds, for alignment output.
    pub frame_dur: f64,
    pub nodes: Vec<LatNode>,
    pub arcs: Vec<LatArc>,
}

/// Which fields are written, one flag per format character:
/// `A` absolute alignment times, `B` binary, `t` node times, `v` pronunciation
/// variants, `a` acoustic likelihoods, `l` LM likelihoods, `d` model
/// alignments, `m` model durations, `r` pronunciation likelihoods.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LatFormat {
    pub align_abs: bool,
    pub binary: bool,
    pub times: bool,
    pub pron_variant: bool,
    pub aclike: bool,
    pub lmlike: bool,
    pub align: bool,
    pub align_dur: bool,
    pub prlike: bool,
}

impl LatFormat {
    /// The fields written when no format is configured.
    pub fn standard() -> Self {
        LatFormat {
            times: true,
            pron_variant: true,
            aclike: true,
            lmlike: true,
            prlike: true,
            ..Default::default()
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        let mut f = LatFormat::default();
        for c in s.chars() {
            match c {
                'A' => f.align_abs = true,
                'B' => f.binary = true,
                't' => f.times = true,
                'v' => f.pron_variant = true,
                'a' => f.aclike = true,
                'l' => f.lmlike = true,
                'd' => f.align = true,
                'm' => f.align_dur = true,
                'r' => f.prlike = true,
                'n' => {
                    return Err(DecodeError::Config(
                        "likelihoods for model alignment are not supported".into(),
                    ))
                }
                _ => {
                    return Err(DecodeError::Config(format!(
                        "unknown lattice format flag '{}'",
                        c
                    )))
                }
            }
        }
        Ok(f)
    }
}

impl Lattice {
    /// Index of the unique node with no incoming arcs.
    pub fn start_node(&self) -> Result<u32> {
        self.unique_boundary(true)
    }

    /// Index of the unique node with no outgoing arcs.
    pub fn end_node(&self) -> Result<u32> {
        self.unique_boundary(false)
    }

    fn unique_boundary(&self, start: bool) -> Result<u32> {
        let mut has_edge = vec![false; self.nodes.len()];
        for arc in &self.arcs {
            has_edge[if start { arc.end } else { arc.start } as usize] = true;
        }
        let mut found = None;
        for (i, seen) in has_edge.iter().enumerate() {
            if !seen {
                if found.is_some() {
                    return Err(DecodeError::LatticeFormat(format!(
                        "lattice has multiple {} nodes",
                        if start { "start" } else { "end" }
                    )));
                }
                found = Some(i as u32);
            }
        }
        found.ok_or_else(|| {
            DecodeError::LatticeFormat(format!(
                "lattice has no {} node",
                if start { "start" } else { "end" }
            ))
        })
    }

    /// Combined arc weight under the lattice's scales, as used for pruning
    /// and best-path computation.
    pub fn arc_weight(&self, arc: &LatArc) -> LogFloat {
        self.ac_scale * arc.aclike
            + self.lm_scale * arc.lmlike
            + self.pr_scale * arc.prlike
            + self.wd_penalty
    }

    pub fn write(&self, w: &mut dyn Write, format: LatFormat) -> Result<()> {
        if format.binary {
            self.write_binary(w, format)
        } else {
            self.write_text(w, format)
        }
    }

    fn write_text(&self, w: &mut dyn Write, format: LatFormat) -> Result<()> {
        writeln!(w, "VERSION=1.0")?;
        if let Some(utt) = &self.utterance {
            writeln!(w, "UTTERANCE={}", utt)?;
        }
        writeln!(
            w,
            "lmscale={:.2} wdpenalty={:.2} acscale={:.2} prscale={:.2}",
            self.lm_scale, self.wd_penalty, self.ac_scale, self.pr_scale
        )?;
        writeln!(w, "N={} L={}", self.nodes.len(), self.arcs.len())?;
        for (i, node) in self.nodes.iter().enumerate() {
            write!(w, "I={}", i)?;
            if format.times {
                write!(w, " t={:.2}", node.time)?;
            }
            write!(w, " W={}", node.word)?;
            if format.pron_variant {
                write!(w, " v={}", node.variant)?;
            }
            writeln!(w)?;
        }
        for (j, arc) in self.arcs.iter().enumerate() {
            write!(w, "J={} S={} E={}", j, arc.start, arc.end)?;
            if format.aclike {
                write!(w, " a={:.4}", arc.aclike)?;
            }
            if format.lmlike {
                write!(w, " l={:.4}", arc.lmlike)?;
            }
            if format.prlike {
                write!(w, " r={:.4}", arc.prlike)?;
            }
            if (format.align || format.align_dur || format.align_abs) && !arc.align.is_empty() {
                let mut d = String::from(":");
                let mut t = self.nodes[arc.start as usize].time;
                for seg in &arc.align {
                    if format.align_abs {
                        t += seg.frames as f64 * self.frame_dur;
                        let _ = write!(d, "{},{:.2}:", seg.label, t);
                    } else {
                        let _ = write!(d, "{},{}:", seg.label, seg.frames);
                    }
                }
                write!(w, " d={}", d)?;
            }
            writeln!(w)?;
        }
        Ok(())
    }

    fn write_binary(&self, w: &mut dyn Write, format: LatFormat) -> Result<()> {
        // compact framing: magic, header floats, then nodes and arcs with
        // length-prefixed strings
        w.write_all(b"LATB")?;
        for v in [
            self.lm_scale,
            self.ac_scale,
            self.pr_scale,
            self.wd_penalty,
            self.frame_dur,
        ] {
            w.write_all(&v.to_be_bytes())?;
        }
        write_str(w, self.utterance.as_deref().unwrap_or(""))?;
        w.write_all(&(self.nodes.len() as u32).to_be_bytes())?;
        w.write_all(&(self.arcs.len() as u32).to_be_bytes())?;
        for node in &self.nodes {
            w.write_all(&node.time.to_be_bytes())?;
            w.write_all(&node.variant.to_be_bytes())?;
            write_str(w, &node.word)?;
        }
        for arc in &self.arcs {
            w.write_all(&arc.start.to_be_bytes())?;
            w.write_all(&arc.end.to_be_bytes())?;
            w.write_all(&arc.aclike.to_be_bytes())?;
            w.write_all(&arc.lmlike.to_be_bytes())?;
            w.write_all(&arc.prlike.to_be_bytes())?;
            let n_align = if format.align || format.align_dur {
                arc.align.len() as u32
            } else {
                0
            };
            w.write_all(&n_align.to_be_bytes())?;
            for seg in arc.align.iter().take(n_align as usize) {
                w.write_all(&seg.frames.to_be_bytes())?;
                write_str(w, &seg.label)?;
            }
        }
        Ok(())
    }

    pub fn read(data: &[u8]) -> Result<Lattice> {
        if data.starts_with(b"LATB") {
            Self::read_binary(data)
        } else {
            Self::read_text(data)
        }
    }

    fn read_text(data: &[u8]) -> Result<Lattice> {
        let text = std::str::from_utf8(data)
            .map_err(|_| DecodeError::LatticeFormat("lattice is not valid UTF-8".into()))?;
        let mut lat = Lattice {
            utterance: None,
            lm_scale: 1.0,
            ac_scale: 1.0,
            pr_scale: 1.0,
            wd_penalty: 0.0,
            frame_dur: 0.01,
            nodes: vec![],
            arcs: vec![],
        };
        let mut n_nodes = 0usize;
        let mut n_arcs = 0usize;

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let fields: Vec<(&str, &str)> = line
                .split_whitespace()
                .filter_map(|tok| tok.split_once('='))
                .collect();
            if fields.is_empty() {
                continue;
            }
            match fields[0].0 {
                "VERSION" => {}
                "UTTERANCE" => lat.utterance = Some(fields[0].1.to_string()),
                "I" => {
                    let mut node = LatNode {
                        time: 0.0,
                        word: "!NULL".into(),
                        variant: 1,
                    };
                    for (k, v) in &fields[1..] {
                        match *k {
                            "t" => node.time = parse_lat_num(v)?,
                            "W" => node.word = v.to_string(),
                            "v" => node.variant = parse_lat_num(v)? as u32,
                            _ => {}
                        }
                    }
                    lat.nodes.push(node);
                }
                "J" => {
                    let mut arc = LatArc {
                        start: 0,
                        end: 0,
                        aclike: 0.0,
                        lmlike: 0.0,
                        prlike: 0.0,
                        align: vec![],
                    };
                    for (k, v) in &fields[1..] {
                        match *k {
                            "S" => arc.start = parse_lat_num(v)? as u32,
                            "E" => arc.end = parse_lat_num(v)? as u32,
                            "a" => arc.aclike = parse_lat_num(v)?,
                            "l" => arc.lmlike = parse_lat_num(v)?,
                            "r" => arc.prlike = parse_lat_num(v)?,
                            "d" => arc.align = parse_align(v),
                            _ => {}
                        }
                    }
                    if arc.start as usize >= n_nodes || arc.end as usize >= n_nodes {
                        return Err(DecodeError::LatticeFormat(format!(
                            "arc endpoint out of range in '{}'",
                            line
                        )));
                    }
                    lat.arcs.push(arc);
                }
                _ => {
                    // header key=value fields
                    for (k, v) in &fields {
                        match *k {
                            "lmscale" => lat.lm_scale = parse_lat_num(v)?,
                            "acscale" => lat.ac_scale = parse_lat_num(v)?,
                            "prscale" => lat.pr_scale = parse_lat_num(v)?,
                            "wdpenalty" => lat.wd_penalty = parse_lat_num(v)?,
                            "N" => n_nodes = parse_lat_num(v)? as usize,
                            "L" => n_arcs = parse_lat_num(v)? as usize,
                            _ => {}
                        }
                    }
                }
            }
        }
        if lat.nodes.len() != n_nodes || lat.arcs.len() != n_arcs {
            return Err(DecodeError::LatticeFormat(format!(
                "expected {} nodes / {} arcs, found {} / {}",
                n_nodes,
                n_arcs,
                lat.nodes.len(),
                lat.arcs.len()
            )));
        }
        Ok(lat)
    }

    fn read_binary(data: &[u8]) -> Result<Lattice> {
        let mut pos = 4usize;
        let mut f64_at = |p: &mut usize| -> Result<f64> {
            let bytes: [u8; 8] = data
                .get(*p..*p + 8)
                .and_then(|s| s.try_into().ok())
                .ok_or_else(|| DecodeError::LatticeFormat("truncated binary lattice".into()))?;
            *p += 8;
            Ok(f64::from_be_bytes(bytes))
        };
        let lm_scale = f64_at(&mut pos)?;
        let ac_scale = f64_at(&mut pos)?;
        let pr_scale = f64_at(&mut pos)?;
        let wd_penalty = f64_at(&mut pos)?;
        let frame_dur = f64_at(&mut pos)?;
        let utt = read_str(data, &mut pos)?;
        let n_nodes = read_u32(data, &mut pos)? as usize;
        let n_arcs = read_u32(data, &mut pos)? as usize;

        let mut nodes = Vec::with_capacity(n_nodes);
        for _ in 0..n_nodes {
            let time = f64_at(&mut pos)?;
            let variant = read_u32(data, &mut pos)?;
            let word = read_str(data, &mut pos)?;
            nodes.push(LatNode {
                time,
                word,
                variant,
            });
        }
        let mut arcs = Vec::with_capacity(n_arcs);
        for _ in 0..n_arcs {
            let start = read_u32(data, &mut pos)?;
            let end = read_u32(data, &mut pos)?;
            let aclike = f64_at(&mut pos)?;
            let lmlike = f64_at(&mut pos)?;
            let prlike = f64_at(&mut pos)?;
            let n_align = read_u32(data, &mut pos)? as usize;
            let mut align = Vec::with_capacity(n_align);
            for _ in 0..n_align {
                let frames = read_u32(data, &mut pos)?;
                let label = read_str(data, &mut pos)?;
                align.push(AlignSeg { label, frames });
            }
            arcs.push(LatArc {
                start,
                end,
                aclike,
                lmlike,
                prlike,
                align,
            });
        }
        Ok(Lattice {
            utterance: if utt.is_empty() { None } else { Some(utt) },
            lm_scale,
            ac_scale,
            pr_scale,
            wd_penalty,
            frame_dur,
            nodes,
            arcs,
        })
    }

    /// Drop every arc not within `beam` of the best path, then, if
    /// `arcs_per_sec > 0`, keep at most that density of arcs by slack.
    /// Unreachable nodes are removed and indices compacted.
    pub fn prune(mut self, beam: LogFloat, arcs_per_sec: f64) -> Result<Lattice> {
        if self.arcs.is_empty() {
            return Ok(self);
        }
        let n = self.nodes.len();
        let mut forward = vec![f64::NEG_INFINITY; n];
        let mut backward = vec![f64::NEG_INFINITY; n];
        forward[self.start_node()? as usize] = 0.0;
        backward[self.end_node()? as usize] = 0.0;

        // nodes in time order give a valid topological order for a lattice
        let mut order: Vec<u32> = (0..n as u32).collect();
        order.sort_by(|&a, &b| {
            self.nodes[a as usize]
                .time
                .total_cmp(&self.nodes[b as usize].time)
                .then(a.cmp(&b))
        });

        let mut out_arcs: Vec<Vec<u32>> = vec![vec![]; n];
        let mut in_arcs: Vec<Vec<u32>> = vec![vec![]; n];
        for (i, arc) in self.arcs.iter().enumerate() {
            out_arcs[arc.start as usize].push(i as u32);
            in_arcs[arc.end as usize].push(i as u32);
        }
        for &node in &order {
            for &ai in &in_arcs[node as usize] {
                let arc = &self.arcs[ai as usize];
                let w = forward[arc.start as usize] + self.arc_weight(arc);
                forward[node as usize] = forward[node as usize].max(w);
            }
        }
        for &node in order.iter().rev() {
            for &ai in &out_arcs[node as usize] {
                let arc = &self.arcs[ai as usize];
                let w = backward[arc.end as usize] + self.arc_weight(arc);
                backward[node as usize] = backward[node as usize].max(w);
            }
        }
        let best = backward[self.start_node()? as usize];

        let slack = |arc: &LatArc| {
            best - (forward[arc.start as usize]
                + self.arc_weight(arc)
                + backward[arc.end as usize])
        };
        let mut keep: Vec<u32> = (0..self.arcs.len() as u32)
            .filter(|&i| slack(&self.arcs[i as usize]) <= beam)
            .collect();

        if arcs_per_sec > 0.0 {
            let duration = self
                .nodes
                .iter()
                .map(|n| n.time)
                .fold(0.0f64, f64::max);
            let max_arcs = ((arcs_per_sec * duration).ceil() as usize).max(1);
            if keep.len() > max_arcs {
                keep.sort_by(|&a, &b| {
                    slack(&self.arcs[a as usize]).total_cmp(&slack(&self.arcs[b as usize]))
                });
                keep.truncate(max_arcs);
                keep.sort_unstable();
            }
        }

        let dropped = self.arcs.len() - keep.len();
        let kept: Vec<LatArc> = keep
            .iter()
            .map(|&i| self.arcs[i as usize].clone())
            .collect();
        self.arcs = kept;

        // compact nodes touched by surviving arcs
        let mut used = vec![false; n];
        for arc in &self.arcs {
            used[arc.start as usize] = true;
            used[arc.end as usize] = true;
        }
        let mut remap = vec![u32::MAX; n];
        let mut nodes = vec![];
        for (i, node) in self.nodes.iter().enumerate() {
            if used[i] {
                remap[i] = nodes.len() as u32;
                nodes.push(node.clone());
            }
        }
        for arc in &mut self.arcs {
            arc.start = remap[arc.start as usize];
            arc.end = remap[arc.end as usize];
        }
        debug!(
            "lattice pruning dropped {} arcs, {} nodes remain",
            dropped,
            nodes.len()
        );
        self.nodes = nodes;
        Ok(self)
    }

    /// All distinct words on lattice nodes, as needed to constrain a
    /// rescoring vocabulary.
    pub fn words(&self) -> Vec<&str> {
        let mut seen = HashMap::new();
        for node in &self.nodes {
            if node.word != "!NULL" {
                seen.entry(node.word.as_str()).or_insert(());
            }
        }
        let mut words: Vec<&str> = seen.into_keys().collect();
        words.sort_unstable();
        words
    }
}

fn parse_lat_num(v: &str) -> Result<f64> {
    v.parse()
        .map_err(|_| DecodeError::LatticeFormat(format!("bad numeric field '{}'", v)))
}

fn parse_align(v: &str) -> Vec<AlignSeg> {
    v.split(':')
        .filter(|s| !s.is_empty())
        .filter_map(|seg| {
            let mut parts = seg.split(',');
            let label = parts.next()?.to_string();
            let frames = parts.next()?.parse().ok()?;
            Some(AlignSeg { label, frames })
        })
        .collect()
}

fn write_str(w: &mut dyn Write, s: &str) -> io::Result<()> {
    w.write_all(&(s.len() as u32).to_be_bytes())?;
    w.write_all(s.as_bytes())
}

fn read_u32(data: &[u8], pos: &mut usize) -> Result<u32> {
    let bytes: [u8; 4] = data
        .get(*pos..*pos + 4)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| DecodeError::LatticeFormat("truncated binary lattice".into()))?;
    *pos += 4;
    Ok(u32::from_be_bytes(bytes))
}

fn read_str(data: &[u8], pos: &mut usize) -> Result<String> {
    let len = read_u32(data, pos)? as usize;
    let s = data
        .get(*pos..*pos + len)
        .ok_or_else(|| DecodeError::LatticeFormat("truncated binary lattice".into()))?;
    *pos += len;
    String::from_utf8(s.to_vec())
        .map_err(|_| DecodeError::LatticeFormat("binary lattice string is not UTF-8".into()))
}

/// Log the per-utterance lattice size at `info` level.
pub fn report(lat: &Lattice) {
    info!(
        "lattice: {} nodes, {} arcs{}",
        lat.nodes.len(),
        lat.arcs.len(),
        lat.utterance
            .as_deref()
            .map(|u| format!(" ({})", u))
            .unwrap_or_default()
    );
}
