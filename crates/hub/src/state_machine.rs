//! Zustandsmaschine einer Hub-Session
//!
//! Reine Funktion ohne IO: `uebergang(zustand, ereignis)` liefert den
//! Folgezustand und die auszufuehrenden Aktionen. Die Uebergangstabelle
//! ist der Vertrag, der Session-Task fuehrt nur die Aktionen aus.
//!
//! ```text
//! Idle -> Connecting -> (Ringing | Streaming) -> Stopping -> Idle
//!           |               |          |            |
//!           +---------------+----------+------------+--> Error (terminal)
//! ```

use intercom_core::{CallState, DeviceId, IntercomError};
use intercom_protocol::frame::{FrameFlags, FrameType};
use std::io;

// ---------------------------------------------------------------------------
// Zustaende und Ereignisse
// ---------------------------------------------------------------------------

/// Zustand einer Hub-Session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionZustand {
    /// Keine Verbindung
    Idle,
    /// TCP-Aufbau und START-Handshake laufen
    Connecting,
    /// Endpunkt klingelt, Audio wird verworfen
    Ringing,
    /// Audio fliesst in beide Richtungen
    Streaming,
    /// STOP gesendet oder empfangen, Queue wird geleert
    Stopping,
    /// Unwiderruflicher Fehler
    Error,
}

impl SessionZustand {
    /// Session ist beendet (nach dem Start nur ueber Idle oder Error erreichbar)
    pub fn ist_beendet(&self) -> bool {
        matches!(self, Self::Idle | Self::Error)
    }

    /// Zustand fuer die UI, falls dieser gemeldet wird
    pub fn als_call_state(&self) -> Option<CallState> {
        match self {
            Self::Ringing => Some(CallState::Ringing),
            Self::Streaming => Some(CallState::Streaming),
            Self::Idle | Self::Error => Some(CallState::Disconnected),
            Self::Connecting | Self::Stopping => None,
        }
    }
}

/// Welche Frist abgelaufen ist
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutArt {
    /// TCP-Verbindung kam nicht zustande
    Verbindungsaufbau,
    /// Keine START-Bestaetigung
    StartAck,
    /// Keine Frames ausserhalb des Streamings
    Keepalive,
    /// Queue nach STOP nicht rechtzeitig geleert
    Drain,
}

/// Diskrete Ereignisse die die Maschine treiben
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEreignis {
    /// Startanfrage
    Start,
    /// TCP-Verbindung steht
    Verbunden,
    /// Ein gueltiger Frame kam an
    FrameEmpfangen {
        typ: FrameType,
        flags: u8,
        fehlercode: Option<u8>,
    },
    Timeout(TimeoutArt),
    /// Lokaler Stopp (Client oder Bridge)
    LocalStop,
    /// Lokaler Stopp bevor die TCP-Verbindung steht
    AufbauAbgebrochen,
    /// Gegenstelle hat die Verbindung geschlossen
    Getrennt(String),
    /// Ungueltiger Header, Strom nicht mehr synchron
    Desync(String),
    /// Lese- oder Schreibfehler
    IoFehler(String),
    /// Ausgangs-Queue nach STOP geleert
    Gedraint,
}

/// Grund fuer das Ende einer Session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Abbruch {
    /// Regulaeres Ende durch lokalen Stopp
    LokalGestoppt,
    /// Regulaeres Ende durch STOP des Endpunkts
    RemoteGestoppt,
    ConnectTimeout(TimeoutArt),
    PeerDisconnected(String),
    Desync(String),
    RemoteError(u8),
    Io(String),
}

impl Abbruch {
    /// Ob das Ende ein Fehler war
    pub fn ist_fehler(&self) -> bool {
        !matches!(self, Self::LokalGestoppt | Self::RemoteGestoppt)
    }

    /// Fehler fuer Aufrufer und UI; `None` bei regulaerem Ende
    pub fn als_fehler(&self, device_id: &DeviceId) -> Option<IntercomError> {
        let fehler = match self {
            Self::LokalGestoppt | Self::RemoteGestoppt => return None,
            Self::ConnectTimeout(TimeoutArt::Verbindungsaufbau) => {
                IntercomError::ConnectTimeout(format!("TCP-Verbindung zu {device_id}"))
            }
            Self::ConnectTimeout(_) => {
                IntercomError::ConnectTimeout(format!("START-Bestaetigung von {device_id}"))
            }
            Self::PeerDisconnected(m) => IntercomError::PeerDisconnected(m.clone()),
            Self::Desync(m) => IntercomError::ProtocolDesync(m.clone()),
            Self::RemoteError(code) => IntercomError::RemoteError { code: *code },
            Self::Io(m) => IntercomError::Io(io::Error::other(m.clone())),
        };
        Some(fehler)
    }

    /// Kurzer Grund fuer die UI
    pub fn grund(&self, device_id: &DeviceId) -> Option<String> {
        self.als_fehler(device_id).map(|e| e.grund())
    }
}

// ---------------------------------------------------------------------------
// Aktionen
// ---------------------------------------------------------------------------

/// Vom Session-Task auszufuehrende Aktion
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Aktion {
    /// TCP-Verbindung aufbauen (mit Verbindungs-Timeout)
    Verbinden,
    /// START senden und auf Bestaetigung warten
    StartSenden,
    StopSenden,
    PongSenden,
    /// Empfangenes Audio an die Gegenseite weitergeben
    AudioWeiterleiten,
    /// Empfangenes Audio verwerfen (klingelt)
    AudioVerwerfen,
    /// Ausgehendes Audio zulassen oder sperren
    AudioFreigeben(bool),
    /// Zustandswechsel an die UI melden
    Melden(CallState),
    /// Ausgangs-Queue leeren, danach schliessen
    Drainen,
    /// Verbindung sofort schliessen
    Schliessen,
    /// Ende der Session festhalten
    Beenden(Abbruch),
}

/// Ergebnis eines Uebergangs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Uebergang {
    pub zustand: SessionZustand,
    pub aktionen: Vec<Aktion>,
}

impl Uebergang {
    fn bleiben(zustand: SessionZustand) -> Self {
        Self {
            zustand,
            aktionen: Vec::new(),
        }
    }

    fn nach(zustand: SessionZustand, aktionen: Vec<Aktion>) -> Self {
        Self { zustand, aktionen }
    }
}

// ---------------------------------------------------------------------------
// Uebergangstabelle
// ---------------------------------------------------------------------------

fn fehler(abbruch: Abbruch) -> Uebergang {
    Uebergang::nach(
        SessionZustand::Error,
        vec![
            Aktion::AudioFreigeben(false),
            Aktion::Schliessen,
            Aktion::Beenden(abbruch),
            Aktion::Melden(CallState::Disconnected),
        ],
    )
}

fn stoppen(stop_senden: bool) -> Uebergang {
    let mut aktionen = vec![Aktion::AudioFreigeben(false)];
    if stop_senden {
        aktionen.push(Aktion::StopSenden);
    }
    aktionen.push(Aktion::Drainen);
    Uebergang::nach(SessionZustand::Stopping, aktionen)
}

fn gestoppt(aktionen_vorher: Vec<Aktion>) -> Uebergang {
    let mut aktionen = aktionen_vorher;
    aktionen.push(Aktion::Schliessen);
    aktionen.push(Aktion::Melden(CallState::Disconnected));
    Uebergang::nach(SessionZustand::Idle, aktionen)
}

/// Berechnet den Folgezustand
pub fn uebergang(zustand: SessionZustand, ereignis: &SessionEreignis) -> Uebergang {
    use SessionEreignis as E;
    use SessionZustand as Z;

    match (zustand, ereignis) {
        // Error ist terminal
        (Z::Error, _) => Uebergang::bleiben(Z::Error),

        (Z::Idle, E::Start) => Uebergang::nach(Z::Connecting, vec![Aktion::Verbinden]),
        (Z::Idle, _) => Uebergang::bleiben(Z::Idle),

        // Fehler aus jedem aktiven Zustand
        (_, E::Desync(m)) => fehler(Abbruch::Desync(m.clone())),
        (_, E::IoFehler(m)) => fehler(Abbruch::Io(m.clone())),

        // --- Connecting ---
        (Z::Connecting, E::Verbunden) => {
            Uebergang::nach(Z::Connecting, vec![Aktion::StartSenden])
        }
        (Z::Connecting, E::Timeout(art)) => fehler(Abbruch::ConnectTimeout(*art)),
        // Noch keine Verbindung: nichts zu senden oder zu leeren
        (Z::Connecting, E::AufbauAbgebrochen) => gestoppt(vec![
            Aktion::AudioFreigeben(false),
            Aktion::Beenden(Abbruch::LokalGestoppt),
        ]),
        (Z::Connecting, E::FrameEmpfangen { typ: FrameType::Start, flags, .. }) => {
            if flags & FrameFlags::RINGING != 0 {
                Uebergang::nach(Z::Ringing, vec![Aktion::Melden(CallState::Ringing)])
            } else {
                Uebergang::nach(
                    Z::Streaming,
                    vec![
                        Aktion::AudioFreigeben(true),
                        Aktion::Melden(CallState::Streaming),
                    ],
                )
            }
        }

        // --- Ringing ---
        (Z::Ringing, E::FrameEmpfangen { typ: FrameType::Start, flags, .. }) => {
            if flags & FrameFlags::RINGING != 0 {
                Uebergang::bleiben(Z::Ringing)
            } else {
                Uebergang::nach(
                    Z::Streaming,
                    vec![
                        Aktion::AudioFreigeben(true),
                        Aktion::Melden(CallState::Streaming),
                    ],
                )
            }
        }
        (Z::Ringing, E::Timeout(TimeoutArt::Keepalive)) => fehler(Abbruch::PeerDisconnected(
            "Keepalive-Zeitlimit ueberschritten".into(),
        )),

        // --- Streaming ---
        (Z::Streaming, E::FrameEmpfangen { typ: FrameType::Audio, .. }) => {
            Uebergang::nach(Z::Streaming, vec![Aktion::AudioWeiterleiten])
        }
        // Keepalive ist waehrend des Streamings ausgesetzt
        (Z::Streaming, E::Timeout(TimeoutArt::Keepalive)) => Uebergang::bleiben(Z::Streaming),

        // --- Stopping ---
        (Z::Stopping, E::Gedraint) => gestoppt(Vec::new()),
        (Z::Stopping, E::Timeout(TimeoutArt::Drain)) => gestoppt(Vec::new()),
        (Z::Stopping, E::Getrennt(_)) => gestoppt(Vec::new()),
        (Z::Stopping, E::FrameEmpfangen { typ: FrameType::Audio, .. }) => {
            Uebergang::nach(Z::Stopping, vec![Aktion::AudioVerwerfen])
        }
        (Z::Stopping, _) => Uebergang::bleiben(Z::Stopping),

        // --- Gemeinsam fuer Connecting, Ringing, Streaming ---
        (z, E::FrameEmpfangen { typ: FrameType::Audio, .. }) => {
            Uebergang::nach(z, vec![Aktion::AudioVerwerfen])
        }
        (z, E::FrameEmpfangen { typ: FrameType::Ping, .. }) => {
            Uebergang::nach(z, vec![Aktion::PongSenden])
        }
        (_, E::FrameEmpfangen { typ: FrameType::Stop, .. }) => {
            let mut u = stoppen(false);
            u.aktionen.push(Aktion::Beenden(Abbruch::RemoteGestoppt));
            u
        }
        (_, E::FrameEmpfangen { typ: FrameType::Error, fehlercode, .. }) => fehler(
            Abbruch::RemoteError(fehlercode.unwrap_or(intercom_protocol::ErrorCode::INTERNAL)),
        ),
        (_, E::LocalStop) => {
            let mut u = stoppen(true);
            u.aktionen.push(Aktion::Beenden(Abbruch::LokalGestoppt));
            u
        }
        (_, E::Getrennt(m)) => fehler(Abbruch::PeerDisconnected(m.clone())),

        // PONG, doppeltes START im Streaming, unpassende Timeouts
        (z, _) => Uebergang::bleiben(z),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
