use std::fmt;

/// Difficulty tier of one actor as seen from another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Con {
    Grey,
    Green,
    Blue,
    Yellow,
    Orange,
    Red,
    Purple,
}

impl Con {
    /// Tier of `other` as seen by an actor of `level`.
    pub fn between(level: u8, other: u8) -> Con {
        Con::from_steps(con_steps(level, other))
    }

    pub fn from_steps(steps: i32) -> Con {
        match steps {
            i32::MIN..=-3 => Con::Grey,
            -2 => Con::Green,
            -1 => Con::Blue,
            0 => Con::Yellow,
            1 => Con::Orange,
            2 => Con::Red,
            _ => Con::Purple,
        }
    }

    /// Signed distance from even (yellow); grey and purple saturate at -3/+3.
    pub fn offset(self) -> i32 {
        match self {
            Con::Grey => -3,
            Con::Green => -2,
            Con::Blue => -1,
            Con::Yellow => 0,
            Con::Orange => 1,
            Con::Red => 2,
            Con::Purple => 3,
        }
    }

    /// Shifts a base percentage by `per_step` for every tier the opponent is
    /// below even, clamped to `[0,100]`. Tougher opponents lower the chance.
    pub fn scale_chance(self, base_percent: u8, per_step: u8) -> u8 {
        let shifted = i32::from(base_percent) - self.offset() * i32::from(per_step);
        shifted.clamp(0, 100) as u8
    }
}

impl fmt::Display for Con {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Con::Grey => "grey",
            Con::Green => "green",
            Con::Blue => "blue",
            Con::Yellow => "yellow",
            Con::Orange => "orange",
            Con::Red => "red",
            Con::Purple => "purple",
        };
        f.write_str(name)
    }
}

/// Highest level that is grey to an observer of the indexed level.
const GREY_AT_OR_BELOW: [i16; 51] = [
    -3, -2, -1, 0, 1, 2, 3, 4, 5, 6, // 0-9
    6, 6, 6, 7, 8, 9, 10, 11, 12, 13, // 10-19
    13, 13, 13, 14, 15, 16, 17, 18, 19, 20, // 20-29
    21, 22, 23, 24, 25, 25, 25, 25, 25, 25, // 30-39
    25, 26, 27, 28, 29, 30, 31, 32, 33, 34, // 40-49
    35, // 50
];

fn con_step(level: u8) -> i32 {
    ((i32::from(level) + 9) / 10).max(1)
}

/// Whole con steps between two levels. Each step spans one tenth of the
/// observer's level (at least one level); partial steps truncate toward even.
pub fn con_steps(level: u8, other: u8) -> i32 {
    (i32::from(other) - i32::from(level)) / con_step(level)
}

/// Whether `other` is too weak to matter to an observer of `level`. Levels up
/// to 50 use a fixed table; above that, three full steps below is grey.
pub fn is_grey(level: u8, other: u8) -> bool {
    match GREY_AT_OR_BELOW.get(usize::from(level)) {
        Some(&limit) => i16::from(other) <= limit,
        None => i32::from(other) - i32::from(level) <= -3 * con_step(level),
    }
}

/// Aggro an NPC of `npc_level` feels toward a target; targets that see the
/// NPC as grey never draw proximity aggro.
pub fn aggro_level_to_target(aggro_level: u8, npc_level: u8, target_level: u8) -> u8 {
    if is_grey(target_level, npc_level) {
        return 0;
    }
    aggro_level.min(100)
}
