//! One-shot migration of absolute coordinates to percent form.
//!
//! Absolute pixel coordinates are a deprecated authoring form tied to the
//! resolution of whatever device the scenario was recorded on. Given that
//! source resolution, this converts them to percent coordinates so the
//! scenario runs correctly on any screen. Only nodes that have absolute
//! but no percent values are touched; the absolute values are left in
//! place (percent wins at execution time).

use crate::device::Resolution;

use super::{ActionParams, NodeKind, Scenario};

/// Converts absolute coordinates in `scenario` to percent, given the
/// resolution it was authored against. Returns the number of nodes
/// migrated.
pub fn migrate_to_percent(scenario: &mut Scenario, source: Resolution) -> usize {
    let width = f64::from(source.width.max(1));
    let height = f64::from(source.height.max(1));
    let mut migrated = 0;

    for node in &mut scenario.nodes {
        let NodeKind::Action { params, .. } = &mut node.kind else {
            continue;
        };
        let changed = match params {
            ActionParams::Tap {
                x,
                y,
                x_percent,
                y_percent,
            }
            | ActionParams::LongPress {
                x,
                y,
                x_percent,
                y_percent,
                ..
            } => migrate_pair(*x, *y, x_percent, y_percent, width, height),
            ActionParams::Swipe {
                start_x,
                start_y,
                end_x,
                end_y,
                start_x_percent,
                start_y_percent,
                end_x_percent,
                end_y_percent,
                ..
            } => {
                let a = migrate_pair(
                    *start_x,
                    *start_y,
                    start_x_percent,
                    start_y_percent,
                    width,
                    height,
                );
                let b = migrate_pair(*end_x, *end_y, end_x_percent, end_y_percent, width, height);
                a || b
            }
            _ => false,
        };
        if changed {
            migrated += 1;
        }
    }
    migrated
}

/// Fills `(x_percent, y_percent)` from `(x, y)` when the percent side is
/// absent. Values may land outside [0, 1] if the stored coordinate
/// exceeds the source resolution; they are kept as-is.
fn migrate_pair(
    x: Option<u32>,
    y: Option<u32>,
    x_percent: &mut Option<f64>,
    y_percent: &mut Option<f64>,
    width: f64,
    height: f64,
) -> bool {
    if x_percent.is_some() || y_percent.is_some() {
        return false;
    }
    let (Some(x), Some(y)) = (x, y) else {
        return false;
    };
    *x_percent = Some(f64::from(x) / width);
    *y_percent = Some(f64::from(y) / height);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scenario::Node;

    fn tap_node(id: &str, params: ActionParams) -> Node {
        Node::new(
            id,
            NodeKind::Action {
                params,
                max_retries: 0,
                retry_interval: 10,
                timeout: None,
            },
        )
    }

    #[test]
    fn absolute_tap_is_migrated() {
        let mut scenario = Scenario::new("s", "s").with_node(tap_node(
            "t1",
            ActionParams::Tap {
                x: Some(540),
                y: Some(1200),
                x_percent: None,
                y_percent: None,
            },
        ));

        let migrated = migrate_to_percent(&mut scenario, Resolution::new(1080, 2400));
        assert_eq!(migrated, 1);
        match &scenario.nodes[0].kind {
            NodeKind::Action {
                params: ActionParams::Tap {
                    x_percent,
                    y_percent,
                    ..
                },
                ..
            } => {
                assert_eq!(*x_percent, Some(0.5));
                assert_eq!(*y_percent, Some(0.5));
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn nodes_with_percent_are_untouched() {
        let mut scenario = Scenario::new("s", "s").with_node(tap_node(
            "t1",
            ActionParams::Tap {
                x: Some(540),
                y: Some(1200),
                x_percent: Some(0.9),
                y_percent: Some(0.9),
            },
        ));

        assert_eq!(
            migrate_to_percent(&mut scenario, Resolution::new(1080, 2400)),
            0
        );
    }

    #[test]
    fn coordinates_beyond_source_exceed_one() {
        let mut scenario = Scenario::new("s", "s").with_node(tap_node(
            "t1",
            ActionParams::Tap {
                x: Some(2160),
                y: Some(1200),
                x_percent: None,
                y_percent: None,
            },
        ));

        migrate_to_percent(&mut scenario, Resolution::new(1080, 2400));
        match &scenario.nodes[0].kind {
            NodeKind::Action {
                params: ActionParams::Tap { x_percent, .. },
                ..
            } => assert_eq!(*x_percent, Some(2.0)),
            _ => unreachable!(),
        }
    }

    #[test]
    fn swipe_halves_migrate_independently() {
        let mut scenario = Scenario::new("s", "s").with_node(tap_node(
            "s1",
            ActionParams::Swipe {
                start_x: Some(540),
                start_y: Some(2000),
                end_x: Some(540),
                end_y: Some(400),
                start_x_percent: None,
                start_y_percent: None,
                end_x_percent: None,
                end_y_percent: None,
                duration: 300,
                direction: None,
                distance: None,
                speed: None,
            },
        ));

        assert_eq!(
            migrate_to_percent(&mut scenario, Resolution::new(1080, 2400)),
            1
        );
        match &scenario.nodes[0].kind {
            NodeKind::Action {
                params:
                    ActionParams::Swipe {
                        start_y_percent,
                        end_y_percent,
                        ..
                    },
                ..
            } => {
                assert!((start_y_percent.unwrap() - 2000.0 / 2400.0).abs() < 1e-9);
                assert!((end_y_percent.unwrap() - 400.0 / 2400.0).abs() < 1e-9);
            }
            _ => unreachable!(),
        }
    }
}
