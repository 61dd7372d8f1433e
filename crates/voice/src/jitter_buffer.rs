//! Wiedergabe-Planung fuer eingehendes Audio (Client-Seite)
//!
//! Bloecke werden nicht sofort abgespielt, sondern auf einer Zeitachse
//! eingeplant. Die Zeitachse ist die Audio-Uhr des Clients (`jetzt` als
//! `Duration` seit Start der Wiedergabe).
//!
//! ## Planungsregel
//! ```text
//! start = max(naechste_abspielzeit, jetzt + min_lookahead)
//! naechste_abspielzeit = start + dauer(block)
//! ```
//! Liegt `start` weiter als `max_lookahead` vor `jetzt`, wird der Block
//! verworfen und die Zeitachse nahe an `jetzt` zurueckgesetzt. Bloecke
//! in der Warteschlange die um mehr als `max_verspaetung` zu spaet sind
//! werden beim Abholen verworfen statt verspaetet abgespielt.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Konfiguration
// ---------------------------------------------------------------------------

/// Konfiguration der Wiedergabe-Planung
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JitterConfig {
    /// Abtastrate der Bloecke
    pub sample_rate: u32,
    /// Mindestabstand eines neuen Blocks zu `jetzt`
    pub min_lookahead_ms: u64,
    /// Maximaler Vorlauf, darueber wird verworfen
    pub max_lookahead_ms: u64,
    /// Wie weit ein Block hinter `jetzt` liegen darf bevor er verworfen wird
    pub max_verspaetung_ms: u64,
}

impl Default for JitterConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            min_lookahead_ms: 40,
            max_lookahead_ms: 200,
            max_verspaetung_ms: 100,
        }
    }
}

impl JitterConfig {
    pub fn min_lookahead(&self) -> Duration {
        Duration::from_millis(self.min_lookahead_ms)
    }

    pub fn max_lookahead(&self) -> Duration {
        Duration::from_millis(self.max_lookahead_ms)
    }

    pub fn max_verspaetung(&self) -> Duration {
        Duration::from_millis(self.max_verspaetung_ms)
    }

    /// Abspieldauer von `samples` Samples
    pub fn dauer(&self, samples: usize) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(samples as u64 * 1_000_000 / self.sample_rate as u64)
    }
}

// ---------------------------------------------------------------------------
// Statistiken
// ---------------------------------------------------------------------------

/// Zaehler der Wiedergabe-Planung (Snapshot)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JitterStatistik {
    /// Eingeplante Bloecke
    pub geplant: u64,
    /// Verworfen weil zu weit voraus
    pub verworfen_voraus: u64,
    /// Verworfen weil beim Abholen zu spaet
    pub verworfen_veraltet: u64,
    /// Abgeholte (abgespielte) Bloecke
    pub abgespielt: u64,
    /// Wie oft die Zeitachse zurueckgesetzt wurde
    pub zurueckgesetzt: u64,
}

impl JitterStatistik {
    /// Summe aller verworfenen Bloecke
    pub fn verworfen(&self) -> u64 {
        self.verworfen_voraus + self.verworfen_veraltet
    }
}

// ---------------------------------------------------------------------------
// Planung
// ---------------------------------------------------------------------------

/// Ergebnis des Einplanens eines Blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Planung {
    /// Block wird bei `start` fuer `dauer` abgespielt
    Abspielen { start: Duration, dauer: Duration },
    /// Block wurde verworfen
    Verworfen,
}

/// Ein eingeplanter Block in der Warteschlange
#[derive(Debug, Clone, PartialEq)]
pub struct GeplanterBlock {
    pub start: Duration,
    pub dauer: Duration,
    pub samples: Vec<i16>,
}

impl GeplanterBlock {
    pub fn ende(&self) -> Duration {
        self.start + self.dauer
    }
}

/// Planer mit Zeitachse und Warteschlange
///
/// Nicht thread-safe, gehoert genau einem Wiedergabepfad.
pub struct WiedergabePlaner {
    config: JitterConfig,
    /// `None` bis zum ersten Block oder nach `zuruecksetzen`
    naechste_abspielzeit: Option<Duration>,
    warteschlange: VecDeque<GeplanterBlock>,
    statistik: JitterStatistik,
}

impl WiedergabePlaner {
    pub fn neu(config: JitterConfig) -> Self {
        Self {
            config,
            naechste_abspielzeit: None,
            warteschlange: VecDeque::new(),
            statistik: JitterStatistik::default(),
        }
    }

    /// Planer mit Standardkonfiguration (16 kHz, 40/200 ms)
    pub fn standard() -> Self {
        Self::neu(JitterConfig::default())
    }

    /// Plant einen Block mit `samples` Samples ein, ohne ihn zu speichern
    pub fn einplanen(&mut self, jetzt: Duration, samples: usize) -> Planung {
        let dauer = self.config.dauer(samples);
        let fruehester = jetzt + self.config.min_lookahead();
        let start = match self.naechste_abspielzeit {
            Some(n) => n.max(fruehester),
            None => fruehester,
        };

        if start > jetzt + self.config.max_lookahead() {
            self.statistik.verworfen_voraus += 1;
            self.statistik.zurueckgesetzt += 1;
            tracing::warn!(
                vorlauf_ms = (start - jetzt).as_millis() as u64,
                verworfen = self.statistik.verworfen_voraus,
                "Audioblock zu weit voraus, verworfen"
            );
            self.zeitachse_kuerzen(fruehester);
            return Planung::Verworfen;
        }

        self.naechste_abspielzeit = Some(start + dauer);
        self.statistik.geplant += 1;
        Planung::Abspielen { start, dauer }
    }

    /// Plant einen Block ein und legt ihn in die Warteschlange
    pub fn push(&mut self, jetzt: Duration, samples: Vec<i16>) -> Planung {
        let planung = self.einplanen(jetzt, samples.len());
        if let Planung::Abspielen { start, dauer } = planung {
            self.warteschlange.push_back(GeplanterBlock {
                start,
                dauer,
                samples,
            });
        }
        planung
    }

    /// Gibt den naechsten faelligen Block zurueck
    ///
    /// Bloecke die um mehr als `max_verspaetung` hinter `jetzt` enden
    /// werden verworfen.
    pub fn abholen(&mut self, jetzt: Duration) -> Option<GeplanterBlock> {
        while let Some(vorne) = self.warteschlange.front() {
            if vorne.start > jetzt {
                return None;
            }
            let block = self.warteschlange.pop_front()?;
            if block.ende() + self.config.max_verspaetung() < jetzt {
                self.statistik.verworfen_veraltet += 1;
                tracing::debug!(
                    verspaetung_ms = (jetzt - block.ende()).as_millis() as u64,
                    "Veralteter Audioblock verworfen"
                );
                continue;
            }
            self.statistik.abgespielt += 1;
            return Some(block);
        }
        None
    }

    /// Setzt die Zeitachse zurueck (z.B. bei Ende eines Streams)
    pub fn zuruecksetzen(&mut self) {
        self.naechste_abspielzeit = None;
        self.warteschlange.clear();
    }

    /// Naechster freier Abspielzeitpunkt
    pub fn naechste_abspielzeit(&self) -> Option<Duration> {
        self.naechste_abspielzeit
    }

    /// Anzahl wartender Bloecke
    pub fn fuellstand(&self) -> usize {
        self.warteschlange.len()
    }

    pub fn statistik(&self) -> JitterStatistik {
        self.statistik.clone()
    }

    pub fn config(&self) -> &JitterConfig {
        &self.config
    }

    // Nach einem Verwerfen: alles ab `ziel` faellt weg, die Zeitachse
    // endet am Ende des letzten verbleibenden Blocks (mindestens `ziel`).
    fn zeitachse_kuerzen(&mut self, ziel: Duration) {
        while self
            .warteschlange
            .back()
            .is_some_and(|b| b.start >= ziel)
        {
            self.warteschlange.pop_back();
            self.statistik.verworfen_voraus += 1;
        }
        let ende = self
            .warteschlange
            .back()
            .map(GeplanterBlock::ende)
            .unwrap_or(ziel);
        self.naechste_abspielzeit = Some(ende.max(ziel));
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
