//! 5-field cron expression -> systemd `OnCalendar` string, pure and
//! deterministic. No calendar math: each field is translated independently
//! and stitched back together.

use anyhow::{bail, Result};

const WEEKDAYS: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];

pub fn cron_to_calendar(expr: &str) -> Result<String> {
  let fields: Vec<&str> = expr.split_whitespace().collect();
  let [minute, hour, day, month, weekday]: [&str; 5] = fields
    .try_into()
    .map_err(|_| anyhow::anyhow!("cron expression {expr:?} must have exactly 5 fields"))?;

  let date = format!("*-{}-{}", convert_numeric_field(month)?, convert_numeric_field(day)?);
  let time = if minute.contains('/') {
    format!("{}:{}", convert_numeric_field(hour)?, convert_numeric_field(minute)?)
  } else {
    format!("{}:{}:00", convert_numeric_field(hour)?, convert_numeric_field(minute)?)
  };
  let dow = convert_weekday_field(weekday)?;

  Ok(match dow {
    Some(dow) => format!("{dow} {date} {time}"),
    None => format!("{date} {time}"),
  })
}

fn convert_numeric_field(field: &str) -> Result<String> {
  if field.is_empty() {
    bail!("empty cron field");
  }
  // systemd calendar syntax accepts the same `*`, `N`, `N-M`, `N,M`, and
  // `*/N` forms as cron for numeric fields, so these pass through as-is.
  Ok(field.to_string())
}

fn convert_weekday_field(field: &str) -> Result<Option<String>> {
  if field == "*" {
    return Ok(None);
  }
  let mut days = Vec::new();
  for item in field.split(',') {
    if let Some((lo, hi)) = item.split_once('-') {
      days.push((parse_weekday(lo)?, Some(parse_weekday(hi)?)));
    } else {
      days.push((parse_weekday(item)?, None));
    }
  }
  let rendered: Vec<String> = days
    .into_iter()
    .map(|(lo, hi)| match hi {
      Some(hi) => format!("{}-{}", WEEKDAYS[lo], WEEKDAYS[hi]),
      None => WEEKDAYS[lo].to_string(),
    })
    .collect();
  Ok(Some(rendered.join(",")))
}

fn parse_weekday(s: &str) -> Result<usize> {
  let n: i32 = s.trim().parse().map_err(|_| anyhow::anyhow!("invalid weekday {s:?}"))?;
  match n {
    0..=6 => Ok(n as usize),
    7 => Ok(0),
    _ => bail!("weekday {n} out of range 0-7"),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn every_minute() {
    assert_eq!(cron_to_calendar("* * * * *").unwrap(), "*-*-* *:*:00");
  }

  #[test]
  fn every_n_minutes() {
    assert_eq!(cron_to_calendar("*/15 * * * *").unwrap(), "*-*-* *:*/15");
  }

  #[test]
  fn fixed_time_daily() {
    assert_eq!(cron_to_calendar("30 4 * * *").unwrap(), "*-*-* 4:30:00");
  }

  #[test]
  fn weekday_range_becomes_mon_fri() {
    assert_eq!(cron_to_calendar("0 9 * * 1-5").unwrap(), "Mon-Fri *-*-* 9:0:00");
  }

  #[test]
  fn weekday_list_becomes_comma_joined() {
    assert_eq!(cron_to_calendar("0 0 * * 6,0").unwrap(), "Sat,Sun *-*-* 0:0:00");
  }

  #[test]
  fn sunday_as_seven_normalizes_to_sun() {
    assert_eq!(cron_to_calendar("0 0 * * 7").unwrap(), "Sun *-*-* 0:0:00");
  }

  #[test]
  fn rejects_wrong_field_count() {
    assert!(cron_to_calendar("* * * *").is_err());
  }

  #[test]
  fn reparsing_is_deterministic() {
    let a = cron_to_calendar("*/5 8-17 * * 1-5").unwrap();
    let b = cron_to_calendar("*/5 8-17 * * 1-5").unwrap();
    assert_eq!(a, b);
  }
}
