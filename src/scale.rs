//! Historical temperaments and MIDI note to pipe frequency mapping.

use serde::{Deserialize, Serialize};

use crate::consts::TUNING_FREQUENCY_DEFAULT;

/// Twelve frequency ratios relative to C.
pub type Table = [f32; 12];

/// Supported temperaments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Temperament {
    Pythagorean,
    MeanQuart,
    Werckm3,
    Kirnberg3,
    WellTemp,
    #[default]
    EqualTemp,
    Ahrend,
    Vallotti,
    Kellner,
    Lehman,
    Pure,
}

const PYTHAGOREAN: Table = [
    1.00000000, 1.06787109, 1.12500000, 1.18518519, 1.26562500, 1.33333333, 1.42382812, 1.50000000, 1.60180664,
    1.68750000, 1.77777778, 1.89843750,
];
const MEAN_QUART: Table = [
    1.0000000, 1.0449067, 1.1180340, 1.1962790, 1.2500000, 1.3374806, 1.3975425, 1.4953488, 1.5625000, 1.6718508,
    1.7888544, 1.8691860,
];
const WERCKM3: Table = [
    1.00000000, 1.05349794, 1.11740331, 1.18518519, 1.25282725, 1.33333333, 1.40466392, 1.49492696, 1.58024691,
    1.67043633, 1.77777778, 1.87924088,
];
const KIRNBERG3: Table = [
    1.00000000, 1.05349794, 1.11848107, 1.18518519, 1.25000021, 1.33333333, 1.40625000, 1.49542183, 1.58024691,
    1.67176840, 1.77777778, 1.87500000,
];
const WELL_TEMP: Table = [
    1.00000000, 1.05468828, 1.12246205, 1.18652432, 1.25282725, 1.33483985, 1.40606829, 1.49830708, 1.58203242,
    1.67705161, 1.77978647, 1.87711994,
];
const EQUAL_TEMP: Table = [
    1.00000000, 1.05946309, 1.12246205, 1.18920712, 1.25992105, 1.33483985, 1.41421356, 1.49830708, 1.58740105,
    1.68179283, 1.78179744, 1.88774863,
];
const AHREND: Table = [
    1.00000000, 1.05064661, 1.11891853, 1.18518519, 1.25197868, 1.33695184, 1.40086215, 1.49594019, 1.57596992,
    1.67383521, 1.78260246, 1.87288523,
];
const VALLOTTI: Table = [
    1.00000000, 1.05647631, 1.12035146, 1.18808855, 1.25518740, 1.33609659, 1.40890022, 1.49689777, 1.58441623,
    1.67705160, 1.78179744, 1.87888722,
];
const KELLNER: Table = [
    1.00000000, 1.05349794, 1.11891853, 1.18518519, 1.25197868, 1.33333333, 1.40466392, 1.49594019, 1.58024691,
    1.67383521, 1.77777778, 1.87796802,
];
const LEHMAN: Table = [
    1.00000000, 1.05826737, 1.11992982, 1.18786496, 1.25424281, 1.33634808, 1.41102316, 1.49661606, 1.58560949,
    1.67610496, 1.77978647, 1.88136421,
];
const PURE: Table = [
    1.00000000, 1.04166667, 1.12500000, 1.1892, 1.25000000, 1.33333333, 1.40625000, 1.50000000, 1.5874, 1.66666667,
    1.77777778, 1.87500000,
];

impl Temperament {
    pub fn all() -> &'static [Temperament] {
        use Temperament::*;
        &[
            Pythagorean,
            MeanQuart,
            Werckm3,
            Kirnberg3,
            WellTemp,
            EqualTemp,
            Ahrend,
            Vallotti,
            Kellner,
            Lehman,
            Pure,
        ]
    }

    /// Display name.
    pub fn name(self) -> &'static str {
        match self {
            Temperament::Pythagorean => "Pythagorean",
            Temperament::MeanQuart => "Meantone 1/4",
            Temperament::Werckm3 => "Werckmeister III",
            Temperament::Kirnberg3 => "Kirnberger III",
            Temperament::WellTemp => "Well-tempered",
            Temperament::EqualTemp => "Equally tempered",
            Temperament::Ahrend => "Ahrend",
            Temperament::Vallotti => "Vallotti",
            Temperament::Kellner => "Kellner",
            Temperament::Lehman => "Lehman",
            Temperament::Pure => "Pure C/F/G",
        }
    }

    pub fn table(self) -> &'static Table {
        match self {
            Temperament::Pythagorean => &PYTHAGOREAN,
            Temperament::MeanQuart => &MEAN_QUART,
            Temperament::Werckm3 => &WERCKM3,
            Temperament::Kirnberg3 => &KIRNBERG3,
            Temperament::WellTemp => &WELL_TEMP,
            Temperament::EqualTemp => &EQUAL_TEMP,
            Temperament::Ahrend => &AHREND,
            Temperament::Vallotti => &VALLOTTI,
            Temperament::Kellner => &KELLNER,
            Temperament::Lehman => &LEHMAN,
            Temperament::Pure => &PURE,
        }
    }
}

/// A temperament applied relative to a reference A.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Scale {
    temperament: Temperament,
}

impl Scale {
    const A4: u8 = 69;

    pub fn new(temperament: Temperament) -> Self {
        Self { temperament }
    }

    pub fn temperament(&self) -> Temperament {
        self.temperament
    }

    pub fn set_temperament(&mut self, temperament: Temperament) {
        self.temperament = temperament;
    }

    pub fn table(&self) -> &'static Table {
        self.temperament.table()
    }

    /// Pipe frequency for a MIDI note, with A4 (note 69) sounding at `a_ref`.
    pub fn frequency_for_note(&self, note: u8, a_ref: f32) -> f32 {
        let table = self.table();
        let pc = (note % 12) as usize;
        let octave = (note / 12) as i32 - (Self::A4 / 12) as i32;
        a_ref * table[pc] / table[(Self::A4 % 12) as usize] * 2.0_f32.powi(octave)
    }

    /// Same as [`frequency_for_note`](Self::frequency_for_note) at 440 Hz.
    pub fn standard_frequency(&self, note: u8) -> f32 {
        self.frequency_for_note(note, TUNING_FREQUENCY_DEFAULT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn a4_sounds_at_reference_in_every_temperament() {
        for &t in Temperament::all() {
            let s = Scale::new(t);
            let f = s.frequency_for_note(69, 415.0);
            assert!((f - 415.0).abs() < 1e-3, "{}: got {f}", t.name());
        }
    }

    #[test]
    fn equal_temperament_semitones() {
        let s = Scale::new(Temperament::EqualTemp);
        let c4 = s.standard_frequency(60);
        assert!((c4 - 261.6256).abs() < 0.01, "got {c4}");
        let a5 = s.standard_frequency(81);
        assert!((a5 - 880.0).abs() < 0.01, "got {a5}");
        let a2 = s.standard_frequency(45);
        assert!((a2 - 110.0).abs() < 0.01, "got {a2}");
    }

    #[test]
    fn tables_start_at_unison_and_ascend() {
        assert_eq!(Temperament::all().len(), 11);
        for &t in Temperament::all() {
            let table = t.table();
            assert_eq!(table[0], 1.0, "{}", t.name());
            assert!(table.windows(2).all(|w| w[0] < w[1]), "{} not ascending", t.name());
            assert!(table[11] < 2.0);
        }
    }

    #[test]
    fn pythagorean_fifth_is_pure() {
        let s = Scale::new(Temperament::Pythagorean);
        let ratio = s.standard_frequency(67) / s.standard_frequency(60);
        assert!((ratio - 1.5).abs() < 1e-4, "got {ratio}");
    }

    #[test]
    fn serde_names_are_lowercase() {
        let json = serde_json::to_string(&Temperament::Werckm3).expect("serialize");
        assert_eq!(json, "\"werckm3\"");
        let t: Temperament = serde_json::from_str("\"meanquart\"").expect("parse");
        assert_eq!(t, Temperament::MeanQuart);
    }
}
