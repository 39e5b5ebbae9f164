//! Tank mixing models: complete-mix (Mix1), two-compartment
//! (Mix2), first-in-first-out (FIFO), and last-in-first-out (LIFO).
//!
//! Each model receives the volume and concentration of this step's inflow
//! and the volume to be withdrawn, and updates the tank's segment list(s)
//! and the reported tank concentration in place.

use crate::model::Tank;
use crate::segment::{SegHandle, SegmentPool};

fn ensure_single_segment(pool: &mut SegmentPool, list: &mut crate::segment::SegList, c: &[f64]) -> SegHandle {
    if list.head.is_none() {
        let h = pool
            .get_free_seg(0.0, c)
            .expect("segment pool has effectively unbounded capacity");
        pool.add_seg(list, h);
    }
    list.head
}

fn blend(pool: &mut SegmentPool, h: SegHandle, v_old: f64, inflow_c: &[f64], inflow_vol: f64) {
    let v_new = v_old + inflow_vol;
    let seg = pool.get_mut(h);
    if v_new > 1e-12 {
        for i in 0..seg.c.len() {
            seg.c[i] = (seg.c[i] * v_old + inflow_c[i] * inflow_vol) / v_new;
        }
    }
    seg.volume = v_new;
}

/// Complete-mix model: the tank is a single segment; inflow blends in
/// instantly, outflow is drawn at the post-blend concentration.
pub fn mix1_tank(pool: &mut SegmentPool, tank: &mut Tank, inflow_vol: f64, inflow_c: &[f64], outflow_vol: f64) {
    let h = ensure_single_segment(pool, &mut tank.segments, &tank.c);
    let v_old = pool.get(h).volume;
    blend(pool, h, v_old, inflow_c, inflow_vol);
    let seg = pool.get_mut(h);
    seg.volume = (seg.volume - outflow_vol).max(0.0);
    tank.c.clone_from(&seg.c);
    tank.volume = seg.volume;
}

/// Two-compartment model: a mixing zone of fixed capacity
/// (`tank.mixing_zone_volume`) blends with inflow first; volume beyond
/// that capacity overflows into a stagnant zone, and a deficit is made up
/// by drawing the stagnant zone back in.
pub fn mix2_tank(pool: &mut SegmentPool, tank: &mut Tank, inflow_vol: f64, inflow_c: &[f64], outflow_vol: f64) {
    let mix_h = ensure_single_segment(pool, &mut tank.segments, &tank.c);
    let stag_h = ensure_single_segment(pool, &mut tank.stagnant_segments, &tank.c);
    let mix_cap = tank.mixing_zone_volume.max(0.0);

    let v_old = pool.get(mix_h).volume;
    blend(pool, mix_h, v_old, inflow_c, inflow_vol);
    let mut v = pool.get(mix_h).volume - outflow_vol;

    if v > mix_cap {
        let overflow = v - mix_cap;
        let mix_c = pool.get(mix_h).c.clone();
        let v_s_old = pool.get(stag_h).volume;
        blend(pool, stag_h, v_s_old, &mix_c, overflow);
        v = mix_cap;
    } else if v < mix_cap {
        let deficit = mix_cap - v;
        let stag_vol = pool.get(stag_h).volume;
        let draw = deficit.min(stag_vol).max(0.0);
        if draw > 0.0 {
            let stag_c = pool.get(stag_h).c.clone();
            blend(pool, mix_h, v, &stag_c, draw);
            v += draw;
            let stag = pool.get_mut(stag_h);
            stag.volume = (stag.volume - draw).max(0.0);
        }
    }

    let mix = pool.get_mut(mix_h);
    mix.volume = v.max(0.0);
    tank.c.clone_from(&mix.c);
    tank.volume = mix.volume + pool.get(stag_h).volume;
}

/// Drains up to `outflow_vol` from the segment list's oldest (FIFO) or
/// newest (LIFO) end, trimming/removing segments as needed.
fn drain(pool: &mut SegmentPool, list: &mut crate::segment::SegList, outflow_vol: f64, from_head: bool) {
    let mut remaining = outflow_vol;
    while remaining > 1e-12 {
        let target = if from_head { list.head } else { list.tail };
        if target.is_none() {
            break;
        }
        let seg_vol = pool.get(target).volume;
        if seg_vol <= remaining {
            remaining -= seg_vol;
            pool.remove_seg(list, target);
        } else {
            pool.get_mut(target).volume -= remaining;
            remaining = 0.0;
        }
    }
}

fn list_volume(pool: &SegmentPool, list: &crate::segment::SegList) -> f64 {
    pool.iter_downstream(list).map(|h| pool.get(h).volume).sum()
}

/// First-in-first-out: inflow adds a new segment at the tail; outflow is
/// drawn from the head (the oldest water in the tank).
pub fn fifo_tank(pool: &mut SegmentPool, tank: &mut Tank, inflow_vol: f64, inflow_c: &[f64], outflow_vol: f64) {
    if inflow_vol > 1e-12 {
        let h = pool
            .get_free_seg(inflow_vol, inflow_c)
            .expect("segment pool has effectively unbounded capacity");
        pool.add_seg(&mut tank.segments, h);
    }
    drain(pool, &mut tank.segments, outflow_vol, true);
    tank.volume = list_volume(pool, &tank.segments);
}

/// Last-in-first-out: inflow and outflow both act at the tail, so water
/// added this step is the first drawn back out if inflow and outflow
/// coexist in the same step.
pub fn lifo_tank(pool: &mut SegmentPool, tank: &mut Tank, inflow_vol: f64, inflow_c: &[f64], outflow_vol: f64) {
    if inflow_vol > 1e-12 {
        let h = pool
            .get_free_seg(inflow_vol, inflow_c)
            .expect("segment pool has effectively unbounded capacity");
        pool.add_seg(&mut tank.segments, h);
    }
    drain(pool, &mut tank.segments, outflow_vol, false);
    tank.volume = list_volume(pool, &tank.segments);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MixModel;
    use crate::segment::SegList;
    use rstest::rstest;

    fn empty_tank(area: f64) -> Tank {
        Tank {
            node: 0,
            area,
            initial_volume: 0.0,
            volume: 0.0,
            mix_model: MixModel::Mix1,
            mixing_zone_volume: 0.0,
            parameters: vec![],
            c: vec![0.0],
            reacted: vec![0.0],
            segments: SegList::default(),
            stagnant_segments: SegList::default(),
        }
    }

    #[test]
    fn mix1_conserves_mass_on_fill() {
        let mut pool = SegmentPool::new(1);
        let mut tank = empty_tank(10.0);
        mix1_tank(&mut pool, &mut tank, 100.0, &[2.0], 0.0);
        assert!((tank.c[0] - 2.0).abs() < 1e-9);
        assert!((tank.volume - 100.0).abs() < 1e-9);

        mix1_tank(&mut pool, &mut tank, 100.0, &[0.0], 100.0);
        // (100*2 + 100*0) / 200 = 1.0, then draw 100 leaving volume 100
        assert!((tank.c[0] - 1.0).abs() < 1e-9);
        assert!((tank.volume - 100.0).abs() < 1e-9);
    }

    #[test]
    fn fifo_preserves_oldest_water_at_the_outlet() {
        let mut pool = SegmentPool::new(1);
        let mut tank = empty_tank(10.0);
        fifo_tank(&mut pool, &mut tank, 50.0, &[1.0], 0.0);
        fifo_tank(&mut pool, &mut tank, 50.0, &[2.0], 0.0);
        // draw 50: should come entirely from the oldest (c=1.0) segment
        fifo_tank(&mut pool, &mut tank, 0.0, &[0.0], 50.0);
        let remaining: Vec<f64> = pool.iter_downstream(&tank.segments).map(|h| pool.get(h).c[0]).collect();
        assert_eq!(remaining, vec![2.0]);
    }

    #[test]
    fn lifo_draws_the_newest_water_first() {
        let mut pool = SegmentPool::new(1);
        let mut tank = empty_tank(10.0);
        lifo_tank(&mut pool, &mut tank, 50.0, &[1.0], 0.0);
        lifo_tank(&mut pool, &mut tank, 50.0, &[2.0], 0.0);
        lifo_tank(&mut pool, &mut tank, 0.0, &[0.0], 50.0);
        let remaining: Vec<f64> = pool.iter_downstream(&tank.segments).map(|h| pool.get(h).c[0]).collect();
        assert_eq!(remaining, vec![1.0]);
    }

    type TankStep = fn(&mut SegmentPool, &mut Tank, f64, &[f64], f64);

    #[rstest]
    #[case::mix1(mix1_tank as TankStep)]
    #[case::fifo(fifo_tank as TankStep)]
    #[case::lifo(lifo_tank as TankStep)]
    fn fill_then_drain_conserves_volume(#[case] step: TankStep) {
        let mut pool = SegmentPool::new(1);
        let mut tank = empty_tank(10.0);
        step(&mut pool, &mut tank, 80.0, &[3.0], 0.0);
        step(&mut pool, &mut tank, 0.0, &[0.0], 30.0);
        assert!((tank.volume - 50.0).abs() < 1e-9);
    }
}
