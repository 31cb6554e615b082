use safehome_common::SwitchStatus;

const ACTIVE_COLOR: &str = "#2196F3";
const IDLE_COLOR: &str = "#9E9E9E";

/// Status page with the toggle and mode buttons.
pub fn index(status: SwitchStatus) -> String {
    let state = if status.state { "ON" } else { "OFF" };
    let mode = if status.auto {
        "Automatic (PIR)"
    } else {
        "Manual"
    };
    let (auto_color, manual_color) = if status.auto {
        (ACTIVE_COLOR, IDLE_COLOR)
    } else {
        (IDLE_COLOR, ACTIVE_COLOR)
    };

    format!(
        r#"<!doctype html>
<html>
<head>
  <meta name="viewport" content="width=device-width, initial-scale=1.0">
  <title>Smart Switch</title>
  <style>
    body{{font-family:Arial,sans-serif;text-align:center;margin-top:50px}}
    button{{background-color:#4CAF50;border:none;color:#fff;padding:15px 32px;font-size:16px;margin:4px 2px;cursor:pointer;border-radius:10px}}
  </style>
</head>
<body>
  <h1>Smart Switch</h1>
  <p>Current state: {state}</p>
  <p>Mode: {mode}</p>
  <button onclick="location.href='/toggle'">Toggle Switch</button><br><br>
  <button onclick="location.href='/setmode?auto=true'" style="background-color:{auto_color}">Auto Mode</button>
  <button onclick="location.href='/setmode?auto=false'" style="background-color:{manual_color}">Manual Mode</button>
</body>
</html>
"#
    )
}
