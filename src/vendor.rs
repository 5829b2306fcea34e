// vendor.rs - Robot controller vendor classes (0x70..=0x7F)
// =========================================================================
//
// Every accessor is one explicit Get/Set request against a vendor class.
// Instances are derived from the caller's index by a per-class rule:
//
//   alarms (0x70)          instance = slot (1..=4)
//   alarm history (0x71)   instance = category base + index
//   position family        instance = control group
//   I/O (0x78)             instance = signal / 10
//   registers, variables   instance = number + 1 (number in direct mode)
//
// Payloads are fixed-width little-endian; strings are NUL padded.

use crate::cip::{self, service};
use crate::encap::Session;
use crate::error::{too_short, EtherNetIpError, Result};
use crate::path::CipPath;
use tokio::time::Duration;
use tracing::debug;

/// Vendor class codes
pub mod class {
    pub const ALARM: u16 = 0x70;
    pub const ALARM_HISTORY: u16 = 0x71;
    pub const STATUS: u16 = 0x72;
    pub const JOB_INFO: u16 = 0x73;
    pub const POSITION: u16 = 0x75;
    pub const POSITION_DEVIATION: u16 = 0x76;
    pub const TORQUE: u16 = 0x77;
    pub const IO: u16 = 0x78;
    pub const REGISTER: u16 = 0x79;
    pub const VARIABLE_B: u16 = 0x7A;
    pub const VARIABLE_I: u16 = 0x7B;
    pub const VARIABLE_D: u16 = 0x7C;
    pub const VARIABLE_R: u16 = 0x7D;
    pub const VARIABLE_S: u16 = 0x7E;
    pub const VARIABLE_P: u16 = 0x7F;
}

/// Single-value attribute used by I/O, registers and variables
const VALUE_ATTRIBUTE: u16 = 1;

const ALARM_LEN: usize = 60;
const ALARM_TIME_LEN: usize = 16;
const ALARM_TEXT_LEN: usize = 32;
const STATUS_LEN: usize = 8;
const JOB_NAME_LEN: usize = 32;
const JOB_INFO_LEN: usize = 44;
pub const AXES: usize = 8;
const AXIS_DATA_LEN: usize = AXES * 4;
const POSITION_LEN: usize = 20 + AXIS_DATA_LEN;
pub const STRING_VARIABLE_LEN: usize = 32;
pub const MAX_CURRENT_ALARMS: u32 = 4;
const HISTORY_SPAN: u32 = 1000;

/// How a caller-given number becomes an instance id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceRule {
    /// instance = index
    Index,
    /// instance = number + 1, or number when direct addressing is on
    NumberPlusOne,
    /// instance = signal / 10
    SignalGroup,
}

impl InstanceRule {
    pub fn instance(self, number: u32, direct: bool) -> Result<u32> {
        let instance = match self {
            InstanceRule::Index => number,
            InstanceRule::NumberPlusOne if direct => number,
            InstanceRule::NumberPlusOne => number.checked_add(1).ok_or_else(|| {
                EtherNetIpError::InvalidArgument(format!("Number {} out of range", number))
            })?,
            InstanceRule::SignalGroup => number / 10,
        };
        if instance == 0 {
            return Err(EtherNetIpError::InvalidArgument(format!(
                "Number {} does not map to a valid instance",
                number
            )));
        }
        Ok(instance)
    }
}

/// Typed program variable families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VariableKind {
    /// Byte
    B,
    /// Integer (16-bit)
    I,
    /// Double (32-bit)
    D,
    /// Real (32-bit float)
    R,
    /// String (32 bytes)
    S,
    /// Position
    P,
}

/// Class, addressing and payload width of one value family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Descriptor {
    pub class: u16,
    pub rule: InstanceRule,
    pub width: usize,
    /// Position data is read as a whole instance, everything else as attribute 1
    pub attribute: Option<u16>,
}

const fn variable(class: u16, width: usize, attribute: Option<u16>) -> Descriptor {
    Descriptor {
        class,
        rule: InstanceRule::NumberPlusOne,
        width,
        attribute,
    }
}

/// Indexed by `VariableKind` discriminant
const VARIABLES: [Descriptor; 6] = [
    variable(class::VARIABLE_B, 1, Some(VALUE_ATTRIBUTE)),
    variable(class::VARIABLE_I, 2, Some(VALUE_ATTRIBUTE)),
    variable(class::VARIABLE_D, 4, Some(VALUE_ATTRIBUTE)),
    variable(class::VARIABLE_R, 4, Some(VALUE_ATTRIBUTE)),
    variable(class::VARIABLE_S, STRING_VARIABLE_LEN, Some(VALUE_ATTRIBUTE)),
    variable(class::VARIABLE_P, POSITION_LEN, None),
];

const REGISTER: Descriptor = Descriptor {
    class: class::REGISTER,
    rule: InstanceRule::NumberPlusOne,
    width: 2,
    attribute: Some(VALUE_ATTRIBUTE),
};

const IO: Descriptor = Descriptor {
    class: class::IO,
    rule: InstanceRule::SignalGroup,
    width: 1,
    attribute: Some(VALUE_ATTRIBUTE),
};

impl VariableKind {
    pub fn descriptor(self) -> Descriptor {
        VARIABLES[self as usize]
    }

    pub fn name(self) -> &'static str {
        match self {
            VariableKind::B => "B",
            VariableKind::I => "I",
            VariableKind::D => "D",
            VariableKind::R => "R",
            VariableKind::S => "S",
            VariableKind::P => "P",
        }
    }
}

impl Descriptor {
    pub fn path(&self, number: u32, direct: bool) -> Result<CipPath> {
        let path = CipPath::new()
            .class(self.class)
            .instance(self.rule.instance(number, direct)?);
        Ok(match self.attribute {
            Some(attribute) => path.attribute(attribute),
            None => path,
        })
    }

    fn read_service(&self) -> u8 {
        if self.attribute.is_some() {
            service::GET_ATTRIBUTE_SINGLE
        } else {
            service::GET_ATTRIBUTES_ALL
        }
    }

    fn write_service(&self) -> u8 {
        if self.attribute.is_some() {
            service::SET_ATTRIBUTE_SINGLE
        } else {
            service::SET_ATTRIBUTES_ALL
        }
    }
}

fn u32_at(data: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

fn i32_at(data: &[u8], at: usize) -> i32 {
    i32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

fn check_len(data: &[u8], needed: usize) -> Result<()> {
    if data.len() < needed {
        return Err(too_short(needed, data.len()));
    }
    Ok(())
}

/// Reads a NUL padded text field
fn fixed_string(data: &[u8]) -> String {
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    String::from_utf8_lossy(&data[..end]).trim_end().to_string()
}

fn axes_at(data: &[u8], at: usize) -> [i32; AXES] {
    let mut axes = [0i32; AXES];
    for (i, axis) in axes.iter_mut().enumerate() {
        *axis = i32_at(data, at + i * 4);
    }
    axes
}

/// Controller status words (class 0x72)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerStatus {
    pub data1: u32,
    pub data2: u32,
}

impl ControllerStatus {
    pub fn decode(data: &[u8]) -> Result<Self> {
        check_len(data, STATUS_LEN)?;
        Ok(Self {
            data1: u32_at(data, 0),
            data2: u32_at(data, 4),
        })
    }

    pub fn step(&self) -> bool {
        self.data1 & 0x01 != 0
    }
    pub fn one_cycle(&self) -> bool {
        self.data1 & 0x02 != 0
    }
    pub fn continuous(&self) -> bool {
        self.data1 & 0x04 != 0
    }
    pub fn running(&self) -> bool {
        self.data1 & 0x08 != 0
    }
    pub fn teach(&self) -> bool {
        self.data1 & 0x20 != 0
    }
    pub fn play(&self) -> bool {
        self.data1 & 0x40 != 0
    }
    pub fn remote(&self) -> bool {
        self.data1 & 0x80 != 0
    }
    /// Any of the pendant, external or command holds
    pub fn hold(&self) -> bool {
        self.data2 & 0x0E != 0
    }
    pub fn alarm(&self) -> bool {
        self.data2 & 0x10 != 0
    }
    pub fn error(&self) -> bool {
        self.data2 & 0x20 != 0
    }
    pub fn servo_on(&self) -> bool {
        self.data2 & 0x40 != 0
    }
}

/// One alarm entry (classes 0x70 and 0x71)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alarm {
    pub code: u32,
    pub data: u32,
    pub alarm_type: u32,
    /// Occurrence time as the controller formats it, e.g. `2024/03/01 10:15`
    pub time: String,
    pub text: String,
}

impl Alarm {
    pub fn decode(data: &[u8]) -> Result<Self> {
        check_len(data, ALARM_LEN)?;
        Ok(Self {
            code: u32_at(data, 0),
            data: u32_at(data, 4),
            alarm_type: u32_at(data, 8),
            time: fixed_string(&data[12..12 + ALARM_TIME_LEN]),
            text: fixed_string(&data[12 + ALARM_TIME_LEN..12 + ALARM_TIME_LEN + ALARM_TEXT_LEN]),
        })
    }

    /// Empty slots report code 0
    pub fn is_active(&self) -> bool {
        self.code != 0
    }
}

/// Alarm history categories and their instance bases
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlarmCategory {
    Major,
    Minor,
    UserSystem,
    UserUser,
    OffLine,
}

impl AlarmCategory {
    pub fn base(self) -> u32 {
        match self {
            AlarmCategory::Major => 1,
            AlarmCategory::Minor => 1001,
            AlarmCategory::UserSystem => 2001,
            AlarmCategory::UserUser => 3001,
            AlarmCategory::OffLine => 4001,
        }
    }

    /// Instance of the `index`-th (0-based) entry
    pub fn instance(self, index: u32) -> Result<u32> {
        if index >= HISTORY_SPAN {
            return Err(EtherNetIpError::InvalidArgument(format!(
                "Alarm history index {} exceeds {}",
                index,
                HISTORY_SPAN - 1
            )));
        }
        Ok(self.base() + index)
    }
}

/// Executing job of the master task (class 0x73)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobInfo {
    pub job_name: String,
    pub line: u32,
    pub step: u32,
    /// Speed override in 0.01 % units
    pub speed_override: u32,
}

impl JobInfo {
    pub fn decode(data: &[u8]) -> Result<Self> {
        check_len(data, JOB_INFO_LEN)?;
        Ok(Self {
            job_name: fixed_string(&data[..JOB_NAME_LEN]),
            line: u32_at(data, JOB_NAME_LEN),
            step: u32_at(data, JOB_NAME_LEN + 4),
            speed_override: u32_at(data, JOB_NAME_LEN + 8),
        })
    }
}

/// Robot position (class 0x75 and P variables)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RobotPosition {
    /// 0 = pulse, 16 = base, 17 = robot, 18 = user, 19 = tool
    pub data_type: u32,
    pub form: u32,
    pub tool: u32,
    pub user_coordinate: u32,
    pub extended_form: u32,
    pub axes: [i32; AXES],
}

impl RobotPosition {
    pub fn decode(data: &[u8]) -> Result<Self> {
        check_len(data, POSITION_LEN)?;
        Ok(Self {
            data_type: u32_at(data, 0),
            form: u32_at(data, 4),
            tool: u32_at(data, 8),
            user_coordinate: u32_at(data, 12),
            extended_form: u32_at(data, 16),
            axes: axes_at(data, 20),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(POSITION_LEN);
        for word in [self.data_type, self.form, self.tool, self.user_coordinate, self.extended_form] {
            out.extend_from_slice(&word.to_le_bytes());
        }
        for axis in self.axes {
            out.extend_from_slice(&axis.to_le_bytes());
        }
        out
    }
}

/// Eight per-axis values (position deviation, torque)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AxisData(pub [i32; AXES]);

impl AxisData {
    pub fn decode(data: &[u8]) -> Result<Self> {
        check_len(data, AXIS_DATA_LEN)?;
        Ok(Self(axes_at(data, 0)))
    }
}

/// Value of a typed program variable
#[derive(Debug, Clone, PartialEq)]
pub enum VariableValue {
    B(u8),
    I(i16),
    D(i32),
    R(f32),
    S(String),
    P(RobotPosition),
}

impl VariableValue {
    pub fn kind(&self) -> VariableKind {
        match self {
            VariableValue::B(_) => VariableKind::B,
            VariableValue::I(_) => VariableKind::I,
            VariableValue::D(_) => VariableKind::D,
            VariableValue::R(_) => VariableKind::R,
            VariableValue::S(_) => VariableKind::S,
            VariableValue::P(_) => VariableKind::P,
        }
    }

    pub fn decode(kind: VariableKind, data: &[u8]) -> Result<Self> {
        check_len(data, kind.descriptor().width)?;
        Ok(match kind {
            VariableKind::B => VariableValue::B(data[0]),
            VariableKind::I => VariableValue::I(i16::from_le_bytes([data[0], data[1]])),
            VariableKind::D => VariableValue::D(i32_at(data, 0)),
            VariableKind::R => VariableValue::R(f32::from_bits(u32_at(data, 0))),
            VariableKind::S => VariableValue::S(fixed_string(&data[..STRING_VARIABLE_LEN])),
            VariableKind::P => VariableValue::P(RobotPosition::decode(data)?),
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(match self {
            VariableValue::B(v) => vec![*v],
            VariableValue::I(v) => v.to_le_bytes().to_vec(),
            VariableValue::D(v) => v.to_le_bytes().to_vec(),
            VariableValue::R(v) => v.to_le_bytes().to_vec(),
            VariableValue::S(text) => {
                if !text.is_ascii() || text.len() > STRING_VARIABLE_LEN {
                    return Err(EtherNetIpError::InvalidArgument(format!(
                        "S variable text must be ASCII and at most {} bytes",
                        STRING_VARIABLE_LEN
                    )));
                }
                let mut out = text.as_bytes().to_vec();
                out.resize(STRING_VARIABLE_LEN, 0);
                out
            }
            VariableValue::P(position) => position.encode(),
        })
    }
}

/// One vendor read: Get-Attribute-Single or Get-Attributes-All with a length floor
async fn read_raw(
    session: &mut Session,
    service: u8,
    path: &CipPath,
    min_len: usize,
    budget: Duration,
) -> Result<Vec<u8>> {
    let response = cip::send_request(session, service, path, &[], budget).await?;
    check_len(&response.data, min_len)?;
    debug!(
        "Vendor read {:02X?} returned {} bytes",
        path.as_bytes(),
        response.data.len()
    );
    Ok(response.data)
}

async fn write_raw(
    session: &mut Session,
    service: u8,
    path: &CipPath,
    data: &[u8],
    budget: Duration,
) -> Result<()> {
    cip::send_request(session, service, path, data, budget).await?;
    debug!("Vendor write {:02X?} ({} bytes)", path.as_bytes(), data.len());
    Ok(())
}

fn instance_path(class: u16, instance: u32) -> CipPath {
    CipPath::new().class(class).instance(instance)
}

pub async fn read_status(session: &mut Session, budget: Duration) -> Result<ControllerStatus> {
    let path = instance_path(class::STATUS, 1);
    let data = read_raw(session, service::GET_ATTRIBUTES_ALL, &path, STATUS_LEN, budget).await?;
    ControllerStatus::decode(&data)
}

/// Reads current alarm `slot` (1..=4)
pub async fn read_alarm(session: &mut Session, slot: u32, budget: Duration) -> Result<Alarm> {
    if !(1..=MAX_CURRENT_ALARMS).contains(&slot) {
        return Err(EtherNetIpError::InvalidArgument(format!(
            "Alarm slot {} outside 1..={}",
            slot, MAX_CURRENT_ALARMS
        )));
    }
    let path = instance_path(class::ALARM, slot);
    let data = read_raw(session, service::GET_ATTRIBUTES_ALL, &path, ALARM_LEN, budget).await?;
    Alarm::decode(&data)
}

pub async fn read_alarm_history(
    session: &mut Session,
    category: AlarmCategory,
    index: u32,
    budget: Duration,
) -> Result<Alarm> {
    let path = instance_path(class::ALARM_HISTORY, category.instance(index)?);
    let data = read_raw(session, service::GET_ATTRIBUTES_ALL, &path, ALARM_LEN, budget).await?;
    Alarm::decode(&data)
}

pub async fn read_job_info(session: &mut Session, budget: Duration) -> Result<JobInfo> {
    let path = instance_path(class::JOB_INFO, 1);
    let data = read_raw(session, service::GET_ATTRIBUTES_ALL, &path, JOB_INFO_LEN, budget).await?;
    JobInfo::decode(&data)
}

fn group_path(class: u16, group: u32) -> Result<CipPath> {
    Ok(instance_path(class, InstanceRule::Index.instance(group, false)?))
}

pub async fn read_position(session: &mut Session, group: u32, budget: Duration) -> Result<RobotPosition> {
    let path = group_path(class::POSITION, group)?;
    let data = read_raw(session, service::GET_ATTRIBUTES_ALL, &path, POSITION_LEN, budget).await?;
    RobotPosition::decode(&data)
}

pub async fn read_position_deviation(session: &mut Session, group: u32, budget: Duration) -> Result<AxisData> {
    let path = group_path(class::POSITION_DEVIATION, group)?;
    let data = read_raw(session, service::GET_ATTRIBUTES_ALL, &path, AXIS_DATA_LEN, budget).await?;
    AxisData::decode(&data)
}

pub async fn read_torque(session: &mut Session, group: u32, budget: Duration) -> Result<AxisData> {
    let path = group_path(class::TORQUE, group)?;
    let data = read_raw(session, service::GET_ATTRIBUTES_ALL, &path, AXIS_DATA_LEN, budget).await?;
    AxisData::decode(&data)
}

/// Reads the 8-point I/O byte holding `signal`
pub async fn read_io(session: &mut Session, signal: u32, budget: Duration) -> Result<u8> {
    let path = IO.path(signal, false)?;
    let data = read_raw(session, IO.read_service(), &path, IO.width, budget).await?;
    Ok(data[0])
}

pub async fn write_io(session: &mut Session, signal: u32, value: u8, budget: Duration) -> Result<()> {
    let path = IO.path(signal, false)?;
    write_raw(session, IO.write_service(), &path, &[value], budget).await
}

pub async fn read_register(session: &mut Session, number: u32, direct: bool, budget: Duration) -> Result<u16> {
    let path = REGISTER.path(number, direct)?;
    let data = read_raw(session, REGISTER.read_service(), &path, REGISTER.width, budget).await?;
    Ok(u16::from_le_bytes([data[0], data[1]]))
}

pub async fn write_register(
    session: &mut Session,
    number: u32,
    value: u16,
    direct: bool,
    budget: Duration,
) -> Result<()> {
    let path = REGISTER.path(number, direct)?;
    write_raw(session, REGISTER.write_service(), &path, &value.to_le_bytes(), budget).await
}

pub async fn read_variable(
    session: &mut Session,
    kind: VariableKind,
    number: u32,
    direct: bool,
    budget: Duration,
) -> Result<VariableValue> {
    let descriptor = kind.descriptor();
    let path = descriptor.path(number, direct)?;
    let data = read_raw(session, descriptor.read_service(), &path, descriptor.width, budget).await?;
    VariableValue::decode(kind, &data)
}

pub async fn write_variable(
    session: &mut Session,
    number: u32,
    value: &VariableValue,
    direct: bool,
    budget: Duration,
) -> Result<()> {
    let descriptor = value.kind().descriptor();
    let path = descriptor.path(number, direct)?;
    let data = value.encode()?;
    write_raw(session, descriptor.write_service(), &path, &data, budget).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_variable_instance_mapping() {
        let b = VariableKind::B.descriptor();
        assert_eq!(b.class, 0x7A);
        assert_eq!(b.rule.instance(5, false).unwrap(), 6);
        assert_eq!(b.rule.instance(5, true).unwrap(), 5);
        assert_eq!(b.path(5, false).unwrap().as_bytes(), &[0x20, 0x7A, 0x24, 6, 0x30, 1]);
        assert!(b.rule.instance(0, true).is_err());
    }

    #[test]
    fn test_descriptor_table() {
        let expected = [
            (VariableKind::B, 0x7A, 1),
            (VariableKind::I, 0x7B, 2),
            (VariableKind::D, 0x7C, 4),
            (VariableKind::R, 0x7D, 4),
            (VariableKind::S, 0x7E, 32),
            (VariableKind::P, 0x7F, 52),
        ];
        for (kind, class, width) in expected {
            let d = kind.descriptor();
            assert_eq!((d.class, d.width), (class, width), "{}", kind.name());
        }
        assert_eq!(VariableKind::P.descriptor().read_service(), service::GET_ATTRIBUTES_ALL);
        assert_eq!(VariableKind::R.descriptor().write_service(), service::SET_ATTRIBUTE_SINGLE);
    }

    #[test]
    fn test_io_instance_is_signal_group() {
        assert_eq!(IO.rule.instance(1, false).ok(), None);
        assert_eq!(IO.rule.instance(10, false).unwrap(), 1);
        assert_eq!(IO.rule.instance(2701, true).unwrap(), 270);
    }

    #[test]
    fn test_alarm_history_instances() {
        assert_eq!(AlarmCategory::Major.instance(0).unwrap(), 1);
        assert_eq!(AlarmCategory::Minor.instance(4).unwrap(), 1005);
        assert_eq!(AlarmCategory::OffLine.instance(0).unwrap(), 4001);
        assert!(AlarmCategory::Major.instance(1000).is_err());
    }

    #[test]
    fn test_alarm_decode() {
        let mut data = Vec::new();
        data.extend_from_slice(&4107u32.to_le_bytes());
        data.extend_from_slice(&2u32.to_le_bytes());
        data.extend_from_slice(&1u32.to_le_bytes());
        let mut time = b"2024/03/01 10:15".to_vec();
        time.resize(16, 0);
        data.extend_from_slice(&time);
        let mut text = b"OUT OF RANGE".to_vec();
        text.resize(32, 0);
        data.extend_from_slice(&text);

        let alarm = Alarm::decode(&data).unwrap();
        assert_eq!(alarm.code, 4107);
        assert_eq!(alarm.time, "2024/03/01 10:15");
        assert_eq!(alarm.text, "OUT OF RANGE");
        assert!(alarm.is_active());
        assert!(matches!(
            Alarm::decode(&data[..59]),
            Err(EtherNetIpError::ResponseTooShort { needed: 60, available: 59 })
        ));
    }

    #[test]
    fn test_status_bits() {
        let status = ControllerStatus::decode(&[0x4C, 0, 0, 0, 0x50, 0, 0, 0]).unwrap();
        assert!(status.continuous());
        assert!(status.running());
        assert!(status.play());
        assert!(!status.teach());
        assert!(status.alarm());
        assert!(status.servo_on());
        assert!(!status.hold());
        assert!(ControllerStatus::decode(&[0; 7]).is_err());
    }

    #[test]
    fn test_position_round_trip() {
        let position = RobotPosition {
            data_type: 16,
            form: 0,
            tool: 1,
            user_coordinate: 0,
            extended_form: 0,
            axes: [100_000, -2_500, 300_000, 1_800_000, 0, -900_000, 0, 0],
        };
        let bytes = position.encode();
        assert_eq!(bytes.len(), 52);
        assert_eq!(RobotPosition::decode(&bytes).unwrap(), position);
    }

    #[test]
    fn test_job_info_decode() {
        let mut data = b"WELD-01".to_vec();
        data.resize(32, 0);
        data.extend_from_slice(&12u32.to_le_bytes());
        data.extend_from_slice(&3u32.to_le_bytes());
        data.extend_from_slice(&10_000u32.to_le_bytes());
        let job = JobInfo::decode(&data).unwrap();
        assert_eq!(job.job_name, "WELD-01");
        assert_eq!((job.line, job.step, job.speed_override), (12, 3, 10_000));
    }

    #[test]
    fn test_variable_values() {
        assert_eq!(
            VariableValue::decode(VariableKind::I, &(-3i16).to_le_bytes()).unwrap(),
            VariableValue::I(-3)
        );
        assert_eq!(
            VariableValue::decode(VariableKind::R, &1.5f32.to_le_bytes()).unwrap(),
            VariableValue::R(1.5)
        );
        assert!(matches!(
            VariableValue::decode(VariableKind::D, &[1, 2]),
            Err(EtherNetIpError::ResponseTooShort { needed: 4, available: 2 })
        ));

        let encoded = VariableValue::S("HELLO".to_string()).encode().unwrap();
        assert_eq!(encoded.len(), 32);
        assert_eq!(
            VariableValue::decode(VariableKind::S, &encoded).unwrap(),
            VariableValue::S("HELLO".to_string())
        );
        assert!(VariableValue::S("x".repeat(33)).encode().is_err());
    }
}
