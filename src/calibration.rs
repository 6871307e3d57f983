//! Instrument calibration from FDSN StationXML inventories.
//!
//! At startup the session asks the Raspberry Shake FDSN service for the
//! station's response-level inventory. The XML is reduced to one
//! [`ChannelResponse`] per channel epoch, holding the overall instrument
//! sensitivity used to convert counts to physical units.

use chrono::{DateTime, NaiveDateTime, Utc};
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::segment::StreamId;
use crate::session::DEFAULT_STATION;

/// FDSN web service serving Raspberry Shake inventories.
pub const INVENTORY_HOST: &str = "https://fdsnws.raspberryshakedata.com";

/// Build the response-level station query for `network.station`.
pub fn inventory_url(host: &str, network: &str, station: &str) -> String {
    format!(
        "{}/fdsnws/station/1/query?network={}&station={}&level=resp&format=xml",
        host.trim_end_matches('/'),
        network,
        station
    )
}

/// Errors while fetching an inventory document.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
}

/// Errors while reading a StationXML document.
#[derive(Debug, Error)]
pub enum InventoryError {
    #[error("Malformed StationXML: {0}")]
    Xml(String),

    #[error("Invalid {field}: {value}")]
    InvalidValue { field: &'static str, value: String },

    #[error("Inventory contains no channel responses")]
    Empty,
}

/// A segment or series could not be matched to a response.
#[derive(Debug, Error)]
pub enum AttachError {
    #[error("No response for {id} at {time}")]
    NoMatchingResponse { id: StreamId, time: DateTime<Utc> },
}

/// Overall response of one channel over one epoch.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelResponse {
    pub network: String,
    pub station: String,
    pub location: String,
    pub channel: String,

    /// Start of the epoch this response is valid for.
    pub start: Option<DateTime<Utc>>,

    /// End of the epoch, `None` if still open.
    pub end: Option<DateTime<Utc>>,

    pub sample_rate: Option<f64>,

    /// Overall sensitivity in counts per input unit.
    pub sensitivity: f64,

    /// Frequency at which the sensitivity is valid, in Hz.
    pub frequency: Option<f64>,

    /// Physical input units, e.g. `M/S`.
    pub input_units: Option<String>,

    pub output_units: Option<String>,

    /// Number of response stages.
    pub stage_count: usize,
}

impl ChannelResponse {
    /// Convert a raw count to input units.
    pub fn to_physical(&self, count: i32) -> f64 {
        count as f64 / self.sensitivity
    }

    fn matches(&self, id: &StreamId, time: DateTime<Utc>) -> bool {
        self.network == id.network
            && self.station == id.station
            && self.location == id.location
            && self.channel == id.channel
            && self.start.is_none_or(|start| time >= start)
            && self.end.is_none_or(|end| time < end)
    }
}

/// Parsed inventory: every channel response it contains.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Inventory {
    responses: Vec<Arc<ChannelResponse>>,
}

impl Inventory {
    pub fn new(responses: Vec<ChannelResponse>) -> Self {
        Self {
            responses: responses.into_iter().map(Arc::new).collect(),
        }
    }

    /// Parse a response-level StationXML document.
    pub fn from_station_xml(xml: &str) -> Result<Self, InventoryError> {
        let inventory = StationXmlParser::default().parse(xml)?;
        if inventory.responses.is_empty() {
            return Err(InventoryError::Empty);
        }
        Ok(inventory)
    }

    pub fn responses(&self) -> &[Arc<ChannelResponse>] {
        &self.responses
    }

    pub fn len(&self) -> usize {
        self.responses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.responses.is_empty()
    }

    /// Distinct channel codes listed for `network.station`.
    pub fn channel_count(&self, network: &str, station: &str) -> usize {
        self.responses
            .iter()
            .filter(|r| r.network == network && r.station == station)
            .map(|r| r.channel.as_str())
            .collect::<BTreeSet<_>>()
            .len()
    }

    /// Find the response for `id` valid at `time`.
    pub fn attach(
        &self,
        id: &StreamId,
        time: DateTime<Utc>,
    ) -> Result<Arc<ChannelResponse>, AttachError> {
        self.responses
            .iter()
            .find(|r| r.matches(id, time))
            .cloned()
            .ok_or_else(|| AttachError::NoMatchingResponse {
                id: id.clone(),
                time,
            })
    }
}

/// Source of raw StationXML documents.
pub trait InventoryFetcher {
    fn fetch(
        &self,
        network: &str,
        station: &str,
    ) -> impl Future<Output = Result<String, FetchError>> + Send;
}

/// Fetches inventories from an FDSN station web service.
pub struct HttpInventoryFetcher {
    client: reqwest::Client,
    host: String,
}

impl HttpInventoryFetcher {
    pub fn new(host: impl Into<String>, timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            host: host.into(),
        })
    }
}

impl InventoryFetcher for HttpInventoryFetcher {
    async fn fetch(&self, network: &str, station: &str) -> Result<String, FetchError> {
        let url = inventory_url(&self.host, network, station);
        debug!("GET {}", url);

        let body = self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        Ok(body)
    }
}

/// Resolve the calibration inventory for `network.station`.
///
/// Never fails: a station code containing the placeholder skips the fetch
/// entirely, and any fetch or parse problem is logged and yields `None`.
pub async fn resolve<F: InventoryFetcher>(
    network: &str,
    station: &str,
    fetcher: &F,
) -> Option<Arc<Inventory>> {
    if station.contains(DEFAULT_STATION) {
        info!("No station name given, continuing without inventory");
        return None;
    }

    info!(
        "Fetching inventory for station {}.{} from FDSN",
        network, station
    );

    let body = match fetcher.fetch(network, station).await {
        Ok(body) => body,
        Err(e) => {
            warn!("Inventory fetch failed, continuing without: {}", e);
            return None;
        }
    };

    match Inventory::from_station_xml(&body) {
        Ok(inventory) => {
            info!(
                "Inventory fetch successful ({} channel response(s))",
                inventory.len()
            );
            Some(Arc::new(inventory))
        }
        Err(e) => {
            warn!("Inventory unusable, continuing without: {}", e);
            None
        }
    }
}

/// Which text node the parser is currently collecting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    SampleRate,
    Sensitivity,
    Frequency,
    InputUnits,
    OutputUnits,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Units {
    Input,
    Output,
}

#[derive(Debug, Default)]
struct PartialChannel {
    location: String,
    channel: String,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    sample_rate: Option<f64>,
    sensitivity: Option<f64>,
    frequency: Option<f64>,
    input_units: Option<String>,
    output_units: Option<String>,
    stage_count: usize,
}

/// Streaming StationXML reader that keeps only what calibration needs.
#[derive(Debug, Default)]
struct StationXmlParser {
    network: String,
    station: String,
    channel: Option<PartialChannel>,
    in_sensitivity: bool,
    units: Option<Units>,
    field: Option<Field>,
    responses: Vec<ChannelResponse>,
}

impl StationXmlParser {
    fn parse(mut self, xml: &str) -> Result<Inventory, InventoryError> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);

        loop {
            match reader.read_event() {
                Ok(Event::Start(e)) => self.start_element(&e)?,
                Ok(Event::End(e)) => self.end_element(e.local_name().as_ref()),
                Ok(Event::Text(e)) => {
                    let text = String::from_utf8_lossy(&e).into_owned();
                    self.text(text.trim())?;
                }
                Ok(Event::Eof) => break,
                Err(e) => {
                    return Err(InventoryError::Xml(format!(
                        "{} at byte {}",
                        e,
                        reader.error_position()
                    )));
                }
                _ => {}
            }
        }

        Ok(Inventory::new(self.responses))
    }

    fn start_element(&mut self, e: &BytesStart<'_>) -> Result<(), InventoryError> {
        match e.local_name().as_ref() {
            b"Network" => self.network = attribute(e, b"code").unwrap_or_default(),
            b"Station" => self.station = attribute(e, b"code").unwrap_or_default(),
            b"Channel" => {
                self.channel = Some(PartialChannel {
                    location: attribute(e, b"locationCode").unwrap_or_default(),
                    channel: attribute(e, b"code").unwrap_or_default(),
                    start: attribute(e, b"startDate")
                        .map(|s| parse_date(&s))
                        .transpose()?,
                    end: attribute(e, b"endDate")
                        .map(|s| parse_date(&s))
                        .transpose()?,
                    ..Default::default()
                });
            }
            b"Stage" => {
                if let Some(channel) = self.channel.as_mut() {
                    channel.stage_count += 1;
                }
            }
            b"InstrumentSensitivity" if self.channel.is_some() => self.in_sensitivity = true,
            b"SampleRate" if self.channel.is_some() => self.field = Some(Field::SampleRate),
            b"Value" if self.in_sensitivity => self.field = Some(Field::Sensitivity),
            b"Frequency" if self.in_sensitivity => self.field = Some(Field::Frequency),
            b"InputUnits" if self.in_sensitivity => self.units = Some(Units::Input),
            b"OutputUnits" if self.in_sensitivity => self.units = Some(Units::Output),
            b"Name" => {
                self.field = match self.units {
                    Some(Units::Input) => Some(Field::InputUnits),
                    Some(Units::Output) => Some(Field::OutputUnits),
                    None => None,
                };
            }
            _ => {}
        }
        Ok(())
    }

    fn end_element(&mut self, name: &[u8]) {
        self.field = None;
        match name {
            b"InstrumentSensitivity" => self.in_sensitivity = false,
            b"InputUnits" | b"OutputUnits" => self.units = None,
            b"Channel" => {
                if let Some(partial) = self.channel.take() {
                    self.finish_channel(partial);
                }
            }
            _ => {}
        }
    }

    fn text(&mut self, text: &str) -> Result<(), InventoryError> {
        let (Some(field), Some(channel)) = (self.field, self.channel.as_mut()) else {
            return Ok(());
        };

        match field {
            Field::SampleRate => channel.sample_rate = Some(parse_number("SampleRate", text)?),
            Field::Sensitivity => channel.sensitivity = Some(parse_number("Value", text)?),
            Field::Frequency => channel.frequency = Some(parse_number("Frequency", text)?),
            Field::InputUnits => channel.input_units = Some(text.to_string()),
            Field::OutputUnits => channel.output_units = Some(text.to_string()),
        }
        Ok(())
    }

    fn finish_channel(&mut self, partial: PartialChannel) {
        let Some(sensitivity) = partial.sensitivity.filter(|s| *s != 0.0) else {
            debug!(
                "Skipping {}.{}.{}.{}: no instrument sensitivity",
                self.network, self.station, partial.location, partial.channel
            );
            return;
        };

        self.responses.push(ChannelResponse {
            network: self.network.clone(),
            station: self.station.clone(),
            location: partial.location,
            channel: partial.channel,
            start: partial.start,
            end: partial.end,
            sample_rate: partial.sample_rate,
            sensitivity,
            frequency: partial.frequency,
            input_units: partial.input_units,
            output_units: partial.output_units,
            stage_count: partial.stage_count,
        });
    }
}

/// Value of attribute `key` on element `e`.
fn attribute(e: &BytesStart<'_>, key: &[u8]) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.local_name().as_ref() == key)
        .map(|a| String::from_utf8_lossy(&a.value).into_owned())
}

fn parse_number(field: &'static str, text: &str) -> Result<f64, InventoryError> {
    text.parse::<f64>()
        .map_err(|_| InventoryError::InvalidValue {
            field,
            value: text.to_string(),
        })
}

/// Parse StationXML dates, with or without a zone suffix.
fn parse_date(s: &str) -> Result<DateTime<Utc>, InventoryError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|_| InventoryError::InvalidValue {
            field: "date",
            value: s.to_string(),
        })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    pub(crate) const STATION_XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<FDSNStationXML xmlns="http://www.fdsn.org/xml/station/1" schemaVersion="1.1">
  <Source>RaspberryShake</Source>
  <Network code="AM">
    <Station code="R0000" startDate="2019-01-01T00:00:00">
      <Channel code="EHZ" locationCode="00" startDate="2019-01-01T00:00:00">
        <SampleRate>100</SampleRate>
        <Response>
          <InstrumentSensitivity>
            <Value>399650000</Value>
            <Frequency>5</Frequency>
            <InputUnits><Name>M/S</Name></InputUnits>
            <OutputUnits><Name>COUNTS</Name></OutputUnits>
          </InstrumentSensitivity>
          <Stage number="1">
            <PolesZeros>
              <InputUnits><Name>M/S</Name></InputUnits>
              <OutputUnits><Name>V</Name></OutputUnits>
            </PolesZeros>
            <StageGain><Value>28.8</Value><Frequency>5</Frequency></StageGain>
          </Stage>
          <Stage number="2">
            <StageGain><Value>13876800</Value><Frequency>5</Frequency></StageGain>
          </Stage>
        </Response>
      </Channel>
      <Channel code="HDF" locationCode="00" startDate="2019-01-01T00:00:00Z" endDate="2020-01-01T00:00:00Z">
        <SampleRate>100</SampleRate>
        <Response>
          <InstrumentSensitivity>
            <Value>56000</Value>
            <Frequency>5</Frequency>
            <InputUnits><Name>PA</Name></InputUnits>
            <OutputUnits><Name>COUNTS</Name></OutputUnits>
          </InstrumentSensitivity>
        </Response>
      </Channel>
    </Station>
  </Network>
</FDSNStationXML>"#;

    struct FakeFetcher {
        body: Option<String>,
        calls: AtomicUsize,
    }

    impl FakeFetcher {
        fn returning(body: Option<&str>) -> Self {
            Self {
                body: body.map(str::to_string),
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl InventoryFetcher for FakeFetcher {
        async fn fetch(&self, _network: &str, _station: &str) -> Result<String, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.body {
                Some(body) => Ok(body.clone()),
                // An unroutable URL yields a real reqwest error without a server.
                None => Err(reqwest::get("http://[::1]:0/").await.unwrap_err().into()),
            }
        }
    }

    fn at(s: &str) -> DateTime<Utc> {
        parse_date(s).unwrap()
    }

    #[test]
    fn test_inventory_url() {
        assert_eq!(
            inventory_url(INVENTORY_HOST, "AM", "R0000"),
            "https://fdsnws.raspberryshakedata.com/fdsnws/station/1/query?network=AM&station=R0000&level=resp&format=xml"
        );
        assert_eq!(
            inventory_url("http://localhost:8080/", "AM", "R1"),
            "http://localhost:8080/fdsnws/station/1/query?network=AM&station=R1&level=resp&format=xml"
        );
    }

    #[test]
    fn test_parse_station_xml() {
        let inventory = Inventory::from_station_xml(STATION_XML).unwrap();
        assert_eq!(inventory.len(), 2);

        let ehz = &inventory.responses()[0];
        assert_eq!(ehz.network, "AM");
        assert_eq!(ehz.station, "R0000");
        assert_eq!(ehz.location, "00");
        assert_eq!(ehz.channel, "EHZ");
        assert_eq!(ehz.sensitivity, 399650000.0);
        assert_eq!(ehz.frequency, Some(5.0));
        assert_eq!(ehz.input_units.as_deref(), Some("M/S"));
        assert_eq!(ehz.output_units.as_deref(), Some("COUNTS"));
        assert_eq!(ehz.sample_rate, Some(100.0));
        assert_eq!(ehz.stage_count, 2);
        assert_eq!(ehz.end, None);

        let hdf = &inventory.responses()[1];
        assert_eq!(hdf.input_units.as_deref(), Some("PA"));
        assert_eq!(hdf.end, Some(at("2020-01-01T00:00:00Z")));
    }

    #[test]
    fn test_empty_inventory_is_error() {
        let xml = r#"<FDSNStationXML><Network code="AM"><Station code="R0000"/></Network></FDSNStationXML>"#;
        assert!(matches!(
            Inventory::from_station_xml(xml),
            Err(InventoryError::Empty)
        ));
    }

    #[test]
    fn test_malformed_xml_is_error() {
        assert!(Inventory::from_station_xml("<FDSNStationXML><Network></Station>").is_err());
    }

    #[test]
    fn test_invalid_sensitivity_is_error() {
        let xml = STATION_XML.replace("399650000", "lots");
        assert!(matches!(
            Inventory::from_station_xml(&xml),
            Err(InventoryError::InvalidValue { field: "Value", .. })
        ));
    }

    #[test]
    fn test_attach_matches_epoch() {
        let inventory = Inventory::from_station_xml(STATION_XML).unwrap();
        let hdf = StreamId::new("AM", "R0000", "00", "HDF");

        assert!(inventory.attach(&hdf, at("2019-06-01T00:00:00Z")).is_ok());
        assert!(matches!(
            inventory.attach(&hdf, at("2021-06-01T00:00:00Z")),
            Err(AttachError::NoMatchingResponse { .. })
        ));
    }

    #[test]
    fn test_attach_unknown_channel() {
        let inventory = Inventory::from_station_xml(STATION_XML).unwrap();
        let ene = StreamId::new("AM", "R0000", "00", "ENE");
        assert!(inventory.attach(&ene, at("2021-06-01T00:00:00Z")).is_err());
        assert_eq!(inventory.channel_count("AM", "R0000"), 2);
    }

    #[test]
    fn test_to_physical() {
        let inventory = Inventory::from_station_xml(STATION_XML).unwrap();
        let hdf = &inventory.responses()[1];
        assert!((hdf.to_physical(56000) - 1.0).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_resolve_skips_placeholder_station() {
        let fetcher = FakeFetcher::returning(Some(STATION_XML));
        assert!(resolve("AM", DEFAULT_STATION, &fetcher).await.is_none());
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_resolve_skips_station_containing_placeholder() {
        let fetcher = FakeFetcher::returning(Some(STATION_XML));
        assert!(resolve("AM", "XZ0000", &fetcher).await.is_none());
        assert!(resolve("AM", "Z00001", &fetcher).await.is_none());
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_resolve_fetches_once() {
        let fetcher = FakeFetcher::returning(Some(STATION_XML));
        let inventory = resolve("AM", "R0000", &fetcher).await.unwrap();
        assert_eq!(inventory.len(), 2);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_resolve_downgrades_bad_document() {
        let fetcher = FakeFetcher::returning(Some("<html>Service unavailable</html>"));
        assert!(resolve("AM", "R0000", &fetcher).await.is_none());
    }

    #[tokio::test]
    async fn test_resolve_downgrades_fetch_failure() {
        let fetcher = FakeFetcher::returning(None);
        assert!(resolve("AM", "R0000", &fetcher).await.is_none());
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }
}
