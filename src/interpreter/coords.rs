//! Percent-coordinate remapping.
//!
//! Coordinate actions come with absolute pixels (deprecated) or percent
//! values normally in [0, 1]. Percent values are multiplied by the
//! device resolution at execution time; when both forms are present the
//! percent form wins. Out-of-range percent values are passed through
//! unclamped (negative results floor at zero, the driver decides what to
//! do with off-screen coordinates).

use crate::device::Resolution;
use crate::scenario::SwipeDirection;

/// Resolves one point from its absolute and percent forms.
///
/// Returns `None` when neither form is complete.
pub fn resolve_point(
    abs: (Option<u32>, Option<u32>),
    percent: (Option<f64>, Option<f64>),
    resolution: Resolution,
) -> Option<(u32, u32)> {
    if let (Some(xp), Some(yp)) = percent {
        let x = (xp * f64::from(resolution.width)).round().max(0.0) as u32;
        let y = (yp * f64::from(resolution.height)).round().max(0.0) as u32;
        return Some((x, y));
    }
    match abs {
        (Some(x), Some(y)) => Some((x, y)),
        _ => None,
    }
}

/// Resolves the endpoints of a swipe.
///
/// Explicit start/end coordinates (percent or absolute, percent winning)
/// take precedence; otherwise a `direction` shorthand swipes from screen
/// centre over `distance` pixels (default: 40% of the travelled axis).
#[allow(clippy::too_many_arguments)]
pub fn resolve_swipe(
    start_abs: (Option<u32>, Option<u32>),
    end_abs: (Option<u32>, Option<u32>),
    start_percent: (Option<f64>, Option<f64>),
    end_percent: (Option<f64>, Option<f64>),
    direction: Option<SwipeDirection>,
    distance: Option<u32>,
    resolution: Resolution,
) -> Option<((u32, u32), (u32, u32))> {
    let start = resolve_point(start_abs, start_percent, resolution);
    let end = resolve_point(end_abs, end_percent, resolution);
    if let (Some(start), Some(end)) = (start, end) {
        return Some((start, end));
    }

    let direction = direction?;
    let centre = (resolution.width / 2, resolution.height / 2);
    let travel = |axis: u32| distance.unwrap_or(axis * 2 / 5);
    let end = match direction {
        SwipeDirection::Up => (
            centre.0,
            centre.1.saturating_sub(travel(resolution.height)),
        ),
        SwipeDirection::Down => (centre.0, centre.1 + travel(resolution.height)),
        SwipeDirection::Left => (
            centre.0.saturating_sub(travel(resolution.width)),
            centre.1,
        ),
        SwipeDirection::Right => (centre.0 + travel(resolution.width), centre.1),
    };
    Some((centre, end))
}

#[cfg(test)]
mod tests {
    use super::*;

    const RES: Resolution = Resolution {
        width: 1080,
        height: 2400,
    };

    #[test]
    fn percent_scales_with_resolution() {
        assert_eq!(
            resolve_point((None, None), (Some(0.5), Some(0.25)), RES),
            Some((540, 600))
        );
    }

    #[test]
    fn percent_wins_over_absolute() {
        assert_eq!(
            resolve_point((Some(10), Some(10)), (Some(1.0), Some(1.0)), RES),
            Some((1080, 2400))
        );
    }

    #[test]
    fn absolute_used_when_no_percent() {
        assert_eq!(
            resolve_point((Some(10), Some(20)), (None, None), RES),
            Some((10, 20))
        );
    }

    #[test]
    fn out_of_range_percent_passes_through() {
        assert_eq!(
            resolve_point((None, None), (Some(1.5), Some(0.5)), RES),
            Some((1620, 1200))
        );
        // negative floors at zero for the unsigned driver surface
        assert_eq!(
            resolve_point((None, None), (Some(-0.5), Some(0.5)), RES),
            Some((0, 1200))
        );
    }

    #[test]
    fn incomplete_coordinates_resolve_to_none() {
        assert_eq!(resolve_point((Some(10), None), (None, None), RES), None);
        assert_eq!(resolve_point((None, None), (Some(0.5), None), RES), None);
    }

    #[test]
    fn direction_swipe_starts_at_centre() {
        let (start, end) = resolve_swipe(
            (None, None),
            (None, None),
            (None, None),
            (None, None),
            Some(SwipeDirection::Up),
            None,
            RES,
        )
        .unwrap();
        assert_eq!(start, (540, 1200));
        assert_eq!(end, (540, 1200 - 960));
    }

    #[test]
    fn explicit_endpoints_beat_direction() {
        let (start, end) = resolve_swipe(
            (None, None),
            (None, None),
            (Some(0.5), Some(0.9)),
            (Some(0.5), Some(0.1)),
            Some(SwipeDirection::Down),
            None,
            RES,
        )
        .unwrap();
        assert_eq!(start, (540, 2160));
        assert_eq!(end, (540, 240));
    }
}
